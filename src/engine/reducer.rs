//! Collapse raw detections into distinct ingredient names

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::Detection;

/// Distinct ingredient names found in one image.
///
/// Order carries no meaning; names are kept sorted so responses are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IngredientSet(BTreeSet<String>);

impl IngredientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        self.0.insert(name.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0.into_iter().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for IngredientSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("class id {class_id} is outside the model's {known} known classes")]
    UnknownClass { class_id: usize, known: usize },
}

/// Resolve class ids against `class_names` and deduplicate
pub fn reduce(detections: &[Detection], class_names: &[String]) -> Result<IngredientSet, ReduceError> {
    detections
        .iter()
        .map(|d| {
            class_names
                .get(d.class_id)
                .map(String::as_str)
                .ok_or(ReduceError::UnknownClass {
                    class_id: d.class_id,
                    known: class_names.len(),
                })
        })
        .collect()
}
