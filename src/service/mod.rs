//! Service layer module

pub mod ingredient_service;
pub mod types;

pub use ingredient_service::IngredientService;
pub use types::*;
