use std::fmt::Write;

use super::{
    card::DishCard,
    form::{DishForm, FormField},
    list::MenuList,
    model::Category,
};

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="es">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
</head>
<body>
<main class="app">
<aside class="sidebar">
<ul>
<li><a href="/">Home</a></li>
<li><a href="/menu">Menu</a></li>
<li><a href="/new-dish">Agregar plato</a></li>
</ul>
</aside>
{body}
</main>
</body>
</html>"#,
        title = escape(title),
    )
}

pub fn menu_page(list: &MenuList) -> String {
    let mut body = String::from(
        r#"<section class="menu">
<h1>Menu</h1>
<a class="button" href="/new-dish">Agregar nuevo plato</a>
"#,
    );
    let _ = writeln!(body, r#"<div class="dishes" data-revision="{}">"#, list.revision());
    if list.is_loading() {
        body.push_str(r#"<div class="skeleton" aria-busy="true">Cargando...</div>"#);
    }
    for card in list.cards() {
        body.push_str(&dish_card(card));
    }
    body.push_str("</div>\n</section>\n");
    body.push_str(MENU_SCRIPT);
    layout("Menu", &body)
}

pub fn dish_card(card: &DishCard) -> String {
    let dish = card.dish();
    let id = escape(&dish.id);
    let checked = if dish.availability { " checked" } else { "" };
    format!(
        r#"<article class="dish" data-id="{id}">
<img src="{image}" alt="{name}" width="285" height="285">
<h3>{name}</h3>
<p class="description">{description}</p>
<p><span>Categoria:</span> <span class="category">{category}</span></p>
<form method="post" action="/menu/{id}/toggle">
<label><input type="checkbox" class="availability"{checked}> <span class="availability-label">{label}</span></label>
<noscript><button type="submit">Cambiar</button></noscript>
</form>
<span class="price">{price}</span>
</article>
"#,
        image = escape(&dish.image),
        name = escape(&dish.name),
        description = escape(&dish.description),
        category = dish.category.as_str(),
        label = card.label(),
        price = dish.price_label(),
    )
}

pub fn new_dish_page(form: &DishForm, upload_id: Option<&str>) -> String {
    let values = form.values();
    let errors = form.visible_errors();
    let error_for = |field: FormField| {
        errors
            .get(&field)
            .map(|msg| {
                format!(
                    r#"<p class="error" data-error-for="{}">{}</p>"#,
                    field.as_str(),
                    escape(msg)
                )
            })
            .unwrap_or_default()
    };

    let known_category = Category::ALL.iter().any(|c| c.as_str() == values.category);
    let mut options = format!(
        r#"<option value=""{} disabled>-- Seleccione categoría --</option>"#,
        if known_category { "" } else { " selected" }
    );
    for category in Category::ALL {
        let selected = if values.category == category.as_str() {
            " selected"
        } else {
            ""
        };
        let _ = write!(
            options,
            r#"<option value="{}"{selected}>{}</option>"#,
            category.as_str(),
            category.label()
        );
    }

    let body = format!(
        r#"<section class="new-dish">
<h1>Platos</h1>
<form method="post" action="/new-dish" id="dish-form" data-phase="{phase}" novalidate>
<label for="name">Nombre</label>
<input id="name" name="name" type="text" placeholder="Ingrese nombre del plato" value="{name}">
{name_error}
<label for="price">Precio</label>
<input id="price" name="price" type="number" step="any" placeholder="Ingrese precio del plato" value="{price}">
{price_error}
<label for="category">Categoría</label>
<select id="category" name="category">{options}</select>
{category_error}
<label for="file">Imagen del plato</label>
<input id="file" type="file" accept="image/*">
<progress id="upload-progress" max="100" value="{progress}"{progress_hidden}></progress>
<input type="hidden" id="image" name="image" value="{image}">
<input type="hidden" id="upload_id" name="upload_id" value="{upload_id}">
<label for="description">Descripción</label>
<textarea id="description" name="description" placeholder="Ingrese descripción del plato">{description}</textarea>
{description_error}
<button type="submit">Agregar plato</button>
</form>
</section>
{script}"#,
        name = escape(&values.name),
        price = escape(&values.price),
        image = escape(&values.image),
        description = escape(&values.description),
        upload_id = escape(upload_id.unwrap_or_default()),
        phase = form.phase().as_str(),
        progress = form.progress(),
        progress_hidden = if form.uploading() { "" } else { " hidden" },
        name_error = error_for(FormField::Name),
        price_error = error_for(FormField::Price),
        category_error = error_for(FormField::Category),
        description_error = error_for(FormField::Description),
        script = FORM_SCRIPT,
    );
    layout("Agregar plato", &body)
}

const MENU_SCRIPT: &str = r#"<script>
const grid = document.querySelector(".dishes");
// Revisions caused by this page's own toggles do not reload it.
let known = Number(grid.dataset.revision);
let pending = 0;
document.querySelectorAll("article.dish").forEach((card) => {
  const box = card.querySelector("input.availability");
  const label = card.querySelector(".availability-label");
  const show = (on) => { box.checked = on; label.textContent = on ? "Disponible" : "No disponible"; };
  box.addEventListener("change", async () => {
    show(box.checked);
    pending += 1;
    try {
      const res = await fetch(`/api/dishes/${card.dataset.id}/availability/toggle`, { method: "POST" });
      const body = await res.json();
      if (res.ok) {
        show(body.availability);
        known = Math.max(known, body.revision);
      }
    } catch (e) {
      console.error("availability update failed", e);
    } finally {
      pending -= 1;
    }
  });
});
(async function watchRevision() {
  try {
    const res = await fetch(`/api/menu/revision?after=${known}`);
    const body = await res.json();
    if (body.revision > known && pending === 0) return location.reload();
    setTimeout(watchRevision, pending > 0 ? 200 : 0);
  } catch (e) {
    setTimeout(watchRevision, 5000);
  }
})();
</script>
"#;

const FORM_SCRIPT: &str = r#"<script>
const form = document.getElementById("dish-form");
const touched = new Set();
const values = () => Object.fromEntries(["name", "price", "category", "image", "description"].map((k) => [k, form.elements[k].value]));
const showErrors = (errors) => {
  form.querySelectorAll("p.error").forEach((p) => p.remove());
  for (const [field, msg] of Object.entries(errors)) {
    const p = document.createElement("p");
    p.className = "error";
    p.dataset.errorFor = field;
    p.textContent = msg;
    form.elements[field].after(p);
  }
};
["name", "price", "category", "description"].forEach((field) => {
  form.elements[field].addEventListener("blur", async () => {
    touched.add(field);
    const res = await fetch("/api/dishes/validate", {
      method: "POST",
      headers: { "content-type": "application/json" },
      body: JSON.stringify({ values: values(), touched: [...touched] }),
    });
    if (res.ok) showErrors((await res.json()).errors);
  });
});
const bar = document.getElementById("upload-progress");
const uploadId = document.getElementById("upload_id");
document.getElementById("file").addEventListener("change", async (ev) => {
  const file = ev.target.files[0];
  if (!file) return;
  if (uploadId.value) fetch(`/api/uploads/${uploadId.value}`, { method: "DELETE" });
  const data = new FormData();
  data.append("file", file);
  bar.hidden = false;
  bar.value = 0;
  const res = await fetch("/api/uploads", { method: "POST", body: data });
  if (!res.ok) return console.error("image upload failed", res.status);
  uploadId.value = (await res.json()).id;
  const poll = async () => {
    const snap = await (await fetch(`/api/uploads/${uploadId.value}`)).json();
    bar.value = snap.progress;
    if (snap.url) { document.getElementById("image").value = snap.url; return; }
    if (snap.error) return console.error("image upload failed", snap.error);
    if (snap.uploading) setTimeout(poll, 300);
  };
  poll();
});
window.addEventListener("pagehide", () => {
  if (uploadId.value && !document.getElementById("image").value) {
    fetch(`/api/uploads/${uploadId.value}`, { method: "DELETE", keepalive: true });
  }
});
</script>
"#;
