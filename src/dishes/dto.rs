use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{
    card::SyncState,
    form::{DishFormValues, FieldErrors, FormField},
};

/// Dish form input, from the HTML form (urlencoded) or the JSON API.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewDishInput {
    pub name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub price: String,
    pub category: String,
    pub image: String,
    pub description: String,
    /// Upload session started from the form, if the user picked a file.
    pub upload_id: String,
}

impl NewDishInput {
    pub fn into_parts(self) -> (DishFormValues, Option<Uuid>) {
        let upload_id = Uuid::parse_str(self.upload_id.trim()).ok();
        (
            DishFormValues {
                name: self.name,
                price: self.price,
                category: self.category,
                image: self.image,
                description: self.description,
            },
            upload_id,
        )
    }
}

/// Accept `12.5` as well as `"12.5"`.
fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub values: NewDishInput,
    #[serde(default)]
    pub touched: Vec<FormField>,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub errors: FieldErrors,
}

#[derive(Debug, Serialize)]
pub struct CreatedDish {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub availability: bool,
    pub sync: SyncState,
    /// Menu revision once this write settled.
    pub revision: u64,
}

#[derive(Debug, Deserialize)]
pub struct RevisionQuery {
    pub after: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RevisionResponse {
    pub revision: u64,
}
