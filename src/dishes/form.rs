//! The new-dish form: field values, touched state, validation and submit.
//!
//! Errors are computed from the current values every time; whether one is
//! shown depends on the field having been blurred or a submit attempted.
//! An image upload runs next to the form and is only read, never awaited.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use validator::Validate;

use super::{
    list::MenuFeed,
    model::{Category, NewDish},
    repo,
};
use crate::backend::Backend;
use crate::images::upload::UploadSnapshot;

pub const MENU_ROUTE: &str = "/menu";

const NAME_REQUIRED: &str = "El nombre del plato es obligatorio";
const PRICE_REQUIRED: &str = "El precio del plato es obligatorio";
const PRICE_NOT_A_NUMBER: &str = "El precio del plato debe ser un número";
const CATEGORY_REQUIRED: &str = "La categoria del plato es obligatoria";
const CATEGORY_INVALID: &str = "La categoria del plato no es válida";
const DESCRIPTION_REQUIRED: &str = "La descripción del plato es obligatoria";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormField {
    Name,
    Price,
    Category,
    Image,
    Description,
}

impl FormField {
    pub fn as_str(self) -> &'static str {
        match self {
            FormField::Name => "name",
            FormField::Price => "price",
            FormField::Category => "category",
            FormField::Image => "image",
            FormField::Description => "description",
        }
    }
}

pub type FieldErrors = BTreeMap<FormField, String>;

/// Raw form input, as typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DishFormValues {
    pub name: String,
    pub price: String,
    pub category: String,
    pub image: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormPhase {
    Idle,
    Validating,
    Uploading,
    Submitting,
    Succeeded,
    Failed,
}

impl FormPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            FormPhase::Idle => "idle",
            FormPhase::Validating => "validating",
            FormPhase::Uploading => "uploading",
            FormPhase::Submitting => "submitting",
            FormPhase::Succeeded => "succeeded",
            FormPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Validation failed; nothing was written.
    Invalid(FieldErrors),
    Created { id: String, redirect: &'static str },
    /// The store refused the write. Already logged.
    Failed,
}

#[derive(Debug, Validate)]
struct DishDraft {
    #[validate(length(min = 3, message = "El nombre del plato debe tener al menos 3 caracteres"))]
    name: String,
    #[validate(range(exclusive_min = 0.0, message = "El precio del plato debe ser mayor a 0"))]
    price: f64,
    #[validate(length(
        min = 10,
        message = "La descripción del plato debe tener al menos 10 caracteres"
    ))]
    description: String,
}

/// Check every rule. Returns the dish to store, or every failing field.
pub fn validate_values(values: &DishFormValues) -> Result<NewDish, FieldErrors> {
    let mut errors = FieldErrors::new();

    let name = values.name.trim();
    if name.is_empty() {
        errors.insert(FormField::Name, NAME_REQUIRED.into());
    }

    let price = match values.price.trim() {
        "" => {
            errors.insert(FormField::Price, PRICE_REQUIRED.into());
            None
        }
        raw => match raw.parse::<f64>() {
            Ok(p) if p.is_finite() => Some(p),
            _ => {
                errors.insert(FormField::Price, PRICE_NOT_A_NUMBER.into());
                None
            }
        },
    };

    let category = match values.category.trim() {
        "" => {
            errors.insert(FormField::Category, CATEGORY_REQUIRED.into());
            None
        }
        raw => match raw.parse::<Category>() {
            Ok(c) => Some(c),
            Err(_) => {
                errors.insert(FormField::Category, CATEGORY_INVALID.into());
                None
            }
        },
    };

    let description = values.description.trim();
    if description.is_empty() {
        errors.insert(FormField::Description, DESCRIPTION_REQUIRED.into());
    }

    let draft = DishDraft {
        name: name.to_string(),
        price: price.unwrap_or(1.0),
        description: description.to_string(),
    };
    if let Err(rule_errors) = draft.validate() {
        for (field, errs) in rule_errors.field_errors() {
            let name: &str = field.as_ref();
            let field = match name {
                "name" => FormField::Name,
                "price" => FormField::Price,
                "description" => FormField::Description,
                _ => continue,
            };
            if let Some(message) = errs.iter().find_map(|e| e.message.as_ref()) {
                errors.entry(field).or_insert_with(|| message.to_string());
            }
        }
    }

    match (price, category) {
        (Some(price), Some(category)) if errors.is_empty() => Ok(NewDish {
            name: draft.name,
            price,
            category,
            image: values.image.trim().to_string(),
            description: draft.description,
        }),
        _ => Err(errors),
    }
}

pub struct DishForm {
    values: DishFormValues,
    touched: BTreeSet<FormField>,
    submit_attempted: bool,
    phase: FormPhase,
    upload: Option<watch::Receiver<UploadSnapshot>>,
    uploading: bool,
    upload_failed: bool,
    progress: f64,
}

impl Default for DishForm {
    fn default() -> Self {
        Self::new(DishFormValues::default())
    }
}

impl DishForm {
    pub fn new(values: DishFormValues) -> Self {
        Self {
            values,
            touched: BTreeSet::new(),
            submit_attempted: false,
            phase: FormPhase::Idle,
            upload: None,
            uploading: false,
            upload_failed: false,
            progress: 0.0,
        }
    }

    pub fn values(&self) -> &DishFormValues {
        &self.values
    }

    pub fn phase(&self) -> FormPhase {
        self.phase
    }

    pub fn uploading(&self) -> bool {
        self.uploading
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    #[cfg(test)]
    pub fn set(&mut self, field: FormField, value: impl Into<String>) {
        let value = value.into();
        match field {
            FormField::Name => self.values.name = value,
            FormField::Price => self.values.price = value,
            FormField::Category => self.values.category = value,
            FormField::Image => self.values.image = value,
            FormField::Description => self.values.description = value,
        }
    }

    pub fn blur(&mut self, field: FormField) {
        self.touched.insert(field);
    }

    /// Every failing rule, shown or not.
    pub fn errors(&self) -> FieldErrors {
        validate_values(&self.values).err().unwrap_or_default()
    }

    /// Errors for fields the user has interacted with, or all of them after a
    /// submit attempt.
    pub fn visible_errors(&self) -> FieldErrors {
        let mut errors = self.errors();
        if !self.submit_attempted {
            errors.retain(|field, _| self.touched.contains(field));
        }
        errors
    }

    /// Follow an upload that was started for this form.
    pub fn attach_upload(&mut self, progress: watch::Receiver<UploadSnapshot>) {
        self.upload = Some(progress);
        self.uploading = true;
        self.upload_failed = false;
        self.progress = 0.0;
        self.sync_upload();
    }

    /// Pull the latest upload state into the form.
    pub fn sync_upload(&mut self) {
        let Some(rx) = &self.upload else {
            return;
        };
        let snap = rx.borrow().clone();
        self.progress = self.progress.max(snap.progress);
        self.uploading = snap.uploading;
        if let Some(url) = snap.url {
            self.values.image = url;
        } else if let Some(err) = &snap.error {
            if !self.upload_failed {
                self.upload_failed = true;
                warn!(error = %err, "image upload failed; continuing without it");
            }
        }
        if matches!(self.phase, FormPhase::Idle | FormPhase::Uploading) {
            self.phase = self.editing_phase();
        }
    }

    /// Validate and, when valid, store the dish.
    ///
    /// Does not wait for an in-flight upload: whatever image is set now is
    /// used, else `placeholder_image`.
    #[instrument(skip_all)]
    pub async fn submit(
        &mut self,
        backend: &Backend,
        placeholder_image: &str,
        feed: &MenuFeed,
    ) -> SubmitOutcome {
        self.submit_attempted = true;
        self.sync_upload();
        self.phase = FormPhase::Validating;

        let mut dish = match validate_values(&self.values) {
            Ok(dish) => dish,
            Err(errors) => {
                self.phase = self.editing_phase();
                return SubmitOutcome::Invalid(errors);
            }
        };
        if dish.image.is_empty() {
            dish.image = placeholder_image.to_string();
        }

        self.phase = FormPhase::Submitting;
        match repo::insert(backend.documents().as_ref(), &dish).await {
            Ok(id) => {
                self.phase = FormPhase::Succeeded;
                feed.bump();
                info!(dish_id = %id, name = %dish.name, "dish created");
                SubmitOutcome::Created {
                    id,
                    redirect: MENU_ROUTE,
                }
            }
            Err(e) => {
                self.phase = FormPhase::Failed;
                error!(error = %e, name = %dish.name, "dish creation failed");
                SubmitOutcome::Failed
            }
        }
    }

    fn editing_phase(&self) -> FormPhase {
        if self.uploading {
            FormPhase::Uploading
        } else {
            FormPhase::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        documents::DocumentStore,
        memory::{MemoryDocumentStore, MemoryObjectStore},
    };
    use crate::config::DEFAULT_PLACEHOLDER_IMAGE;
    use crate::dishes::model::COLLECTION;
    use serde_json::json;
    use std::sync::Arc;

    fn tacos() -> DishFormValues {
        DishFormValues {
            name: "Tacos".into(),
            price: "12.5".into(),
            category: "food".into(),
            image: String::new(),
            description: "Tacos al pastor con piña".into(),
        }
    }

    fn backend() -> (Backend, Arc<MemoryDocumentStore>) {
        let docs = Arc::new(MemoryDocumentStore::new());
        let backend = Backend::in_memory(
            "test",
            docs.clone(),
            Arc::new(MemoryObjectStore::new("memory://dishes")),
        );
        (backend, docs)
    }

    fn snapshot(
        progress: f64,
        uploading: bool,
        url: Option<&str>,
        error: Option<&str>,
    ) -> UploadSnapshot {
        UploadSnapshot {
            progress,
            bytes_transferred: 0,
            total_bytes: 10,
            uploading,
            url: url.map(str::to_string),
            error: error.map(str::to_string),
            cancelled: false,
        }
    }

    #[test]
    fn valid_values_produce_a_new_dish() {
        let dish = validate_values(&tacos()).unwrap();
        assert_eq!(dish.name, "Tacos");
        assert_eq!(dish.price, 12.5);
        assert_eq!(dish.category, Category::Food);
        assert!(dish.image.is_empty());
    }

    #[test]
    fn short_name_reports_min_length() {
        let mut values = tacos();
        values.name = "Ta".into();
        let errors = validate_values(&values).unwrap_err();
        assert_eq!(
            errors.get(&FormField::Name).map(String::as_str),
            Some("El nombre del plato debe tener al menos 3 caracteres")
        );
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn empty_fields_report_required() {
        let errors = validate_values(&DishFormValues::default()).unwrap_err();
        assert_eq!(errors[&FormField::Name], NAME_REQUIRED);
        assert_eq!(errors[&FormField::Price], PRICE_REQUIRED);
        assert_eq!(errors[&FormField::Category], CATEGORY_REQUIRED);
        assert_eq!(errors[&FormField::Description], DESCRIPTION_REQUIRED);
        assert!(!errors.contains_key(&FormField::Image));
    }

    #[test]
    fn non_positive_prices_are_rejected() {
        for price in ["0", "-3", "0.0"] {
            let mut values = tacos();
            values.price = price.into();
            let errors = validate_values(&values).unwrap_err();
            assert_eq!(
                errors[&FormField::Price],
                "El precio del plato debe ser mayor a 0",
                "price {price}"
            );
        }
        for price in ["abc", "NaN", "inf"] {
            let mut values = tacos();
            values.price = price.into();
            let errors = validate_values(&values).unwrap_err();
            assert_eq!(errors[&FormField::Price], PRICE_NOT_A_NUMBER, "price {price}");
        }
        let mut values = tacos();
        values.price = "0.01".into();
        assert!(validate_values(&values).is_ok());
    }

    #[test]
    fn category_must_be_in_the_set() {
        let mut values = tacos();
        values.category = "lunch".into();
        assert_eq!(
            validate_values(&values).unwrap_err()[&FormField::Category],
            CATEGORY_INVALID
        );
    }

    #[test]
    fn description_counts_characters_not_bytes() {
        let mut values = tacos();
        values.description = "piñapiña".into();
        assert_eq!(
            validate_values(&values).unwrap_err()[&FormField::Description],
            "La descripción del plato debe tener al menos 10 caracteres"
        );
        values.description = "piñapiñapi".into();
        assert!(validate_values(&values).is_ok());
    }

    #[test]
    fn errors_show_only_after_blur() {
        let mut form = DishForm::default();
        form.set(FormField::Name, "Ta");
        assert!(form.visible_errors().is_empty());
        assert!(!form.errors().is_empty());

        form.blur(FormField::Name);
        let visible = form.visible_errors();
        assert_eq!(visible.len(), 1);
        assert!(visible.contains_key(&FormField::Name));
    }

    #[tokio::test]
    async fn tacos_are_created_with_placeholder_and_availability() {
        let (backend, docs) = backend();
        let feed = MenuFeed::new();
        let mut form = DishForm::new(tacos());

        let outcome = form.submit(&backend, DEFAULT_PLACEHOLDER_IMAGE, &feed).await;
        let SubmitOutcome::Created { id, redirect } = outcome else {
            panic!("expected Created, got {outcome:?}");
        };
        assert_eq!(redirect, "/menu");
        assert_eq!(form.phase(), FormPhase::Succeeded);
        assert_eq!(feed.current(), 1);

        let stored = docs.list_documents(COLLECTION).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].fields["image"], json!(DEFAULT_PLACEHOLDER_IMAGE));
        assert_eq!(stored[0].fields["availability"], json!(true));
        assert_eq!(stored[0].fields["price"], json!(12.5));
    }

    #[tokio::test]
    async fn short_name_blocks_submission() {
        let (backend, docs) = backend();
        let feed = MenuFeed::new();
        let mut values = tacos();
        values.name = "Ta".into();
        let mut form = DishForm::new(values);

        let outcome = form.submit(&backend, DEFAULT_PLACEHOLDER_IMAGE, &feed).await;
        assert!(matches!(outcome, SubmitOutcome::Invalid(ref e) if e.contains_key(&FormField::Name)));
        assert_eq!(
            form.visible_errors()[&FormField::Name],
            "El nombre del plato debe tener al menos 3 caracteres"
        );
        assert_eq!(form.phase(), FormPhase::Idle);
        assert!(docs.list_documents(COLLECTION).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_upload_url_is_used() {
        let (backend, docs) = backend();
        let feed = MenuFeed::new();
        let (tx, rx) = watch::channel(snapshot(0.0, true, None, None));
        let mut form = DishForm::new(tacos());
        form.attach_upload(rx);
        assert_eq!(form.phase(), FormPhase::Uploading);
        assert!(form.uploading());

        tx.send_replace(snapshot(100.0, false, Some("memory://dishes/dishes/tacos.png"), None));
        form.submit(&backend, DEFAULT_PLACEHOLDER_IMAGE, &feed).await;

        let stored = docs.list_documents(COLLECTION).await.unwrap();
        assert_eq!(stored[0].fields["image"], json!("memory://dishes/dishes/tacos.png"));
        assert_eq!(form.progress(), 100.0);
    }

    #[tokio::test]
    async fn in_flight_upload_does_not_block_submission() {
        let (backend, docs) = backend();
        let feed = MenuFeed::new();
        let (_tx, rx) = watch::channel(snapshot(40.0, true, None, None));
        let mut form = DishForm::new(tacos());
        form.attach_upload(rx);

        let outcome = form.submit(&backend, DEFAULT_PLACEHOLDER_IMAGE, &feed).await;
        assert!(matches!(outcome, SubmitOutcome::Created { .. }));
        let stored = docs.list_documents(COLLECTION).await.unwrap();
        assert_eq!(stored[0].fields["image"], json!(DEFAULT_PLACEHOLDER_IMAGE));
    }

    #[tokio::test]
    async fn failed_upload_clears_flag_and_falls_back() {
        let (backend, docs) = backend();
        let feed = MenuFeed::new();
        let (tx, rx) = watch::channel(snapshot(0.0, true, None, None));
        let mut form = DishForm::new(tacos());
        form.attach_upload(rx);
        tx.send_replace(snapshot(30.0, false, None, Some("part refused")));

        form.sync_upload();
        assert!(!form.uploading());
        assert!(form.upload_failed);
        assert_eq!(form.phase(), FormPhase::Idle);

        form.submit(&backend, DEFAULT_PLACEHOLDER_IMAGE, &feed).await;
        let stored = docs.list_documents(COLLECTION).await.unwrap();
        assert_eq!(stored[0].fields["image"], json!(DEFAULT_PLACEHOLDER_IMAGE));
    }

    #[test]
    fn upload_failure_is_recorded_once_per_upload() {
        let (tx, rx) = watch::channel(snapshot(0.0, true, None, None));
        let mut form = DishForm::new(tacos());
        form.attach_upload(rx);
        assert!(!form.upload_failed);

        tx.send_replace(snapshot(30.0, false, None, Some("part refused")));
        form.sync_upload();
        form.sync_upload();
        assert!(form.upload_failed);
        assert_eq!(form.progress(), 30.0);

        let (_tx, rx) = watch::channel(snapshot(0.0, true, None, None));
        form.attach_upload(rx);
        assert!(!form.upload_failed);
        assert_eq!(form.phase(), FormPhase::Uploading);
    }

    #[test]
    fn phase_names_match_the_wire_format() {
        for phase in [
            FormPhase::Idle,
            FormPhase::Validating,
            FormPhase::Uploading,
            FormPhase::Submitting,
            FormPhase::Succeeded,
            FormPhase::Failed,
        ] {
            assert_eq!(serde_json::to_value(phase).unwrap(), json!(phase.as_str()));
        }
    }

    #[tokio::test]
    async fn store_failure_leaves_the_form_failed() {
        let (backend, docs) = backend();
        docs.fail_creates(true);
        let feed = MenuFeed::new();
        let mut form = DishForm::new(tacos());

        let outcome = form.submit(&backend, DEFAULT_PLACEHOLDER_IMAGE, &feed).await;
        assert_eq!(outcome, SubmitOutcome::Failed);
        assert_eq!(form.phase(), FormPhase::Failed);
        assert!(form.visible_errors().is_empty());
        assert_eq!(feed.current(), 0);
    }
}
