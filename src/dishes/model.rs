use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::documents::{Document, Fields};

pub const COLLECTION: &str = "dishes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Breakfast,
    Food,
    Dinner,
    Drink,
    Dessert,
    Salad,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Breakfast,
        Category::Food,
        Category::Dinner,
        Category::Drink,
        Category::Dessert,
        Category::Salad,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Breakfast => "breakfast",
            Category::Food => "food",
            Category::Dinner => "dinner",
            Category::Drink => "drink",
            Category::Dessert => "dessert",
            Category::Salad => "salad",
        }
    }

    /// Label shown in the category picker.
    pub fn label(self) -> &'static str {
        match self {
            Category::Breakfast => "Desayuno",
            Category::Food => "Comida",
            Category::Dinner => "Cena",
            Category::Drink => "Bebida",
            Category::Dessert => "Postre",
            Category::Salad => "Ensalada",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown category {0:?}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// A dish as rendered by the menu: stored fields plus the document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dish {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub category: Category,
    pub image: String,
    pub description: String,
    pub availability: bool,
}

/// Stored shape of a dish document. The id lives outside the fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DishFields {
    name: String,
    price: f64,
    category: Category,
    image: String,
    description: String,
    #[serde(default = "default_availability")]
    availability: bool,
}

fn default_availability() -> bool {
    true
}

impl Dish {
    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        let f: DishFields = serde_json::from_value(Value::Object(doc.fields))?;
        Ok(Self {
            id: doc.id,
            name: f.name,
            price: f.price,
            category: f.category,
            image: f.image,
            description: f.description,
            availability: f.availability,
        })
    }

    pub fn availability_label(&self) -> &'static str {
        if self.availability {
            "Disponible"
        } else {
            "No disponible"
        }
    }

    pub fn price_label(&self) -> String {
        format!("${:.2}", self.price)
    }
}

/// A validated dish that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewDish {
    pub name: String,
    pub price: f64,
    pub category: Category,
    pub image: String,
    pub description: String,
}

impl NewDish {
    /// Document fields for this dish. New dishes are always available.
    pub fn to_fields(&self) -> anyhow::Result<Fields> {
        let fields = DishFields {
            name: self.name.clone(),
            price: self.price,
            category: self.category,
            image: self.image.clone(),
            description: self.description.clone(),
            availability: true,
        };
        match serde_json::to_value(fields)? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("dish serialized to non-object {other}"),
        }
    }
}
