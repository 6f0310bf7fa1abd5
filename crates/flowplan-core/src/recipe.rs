//! Recipe definitions and the lookup seam used to rebuild Craft pin ratios.
//!
//! The full item/recipe database lives outside this crate. The engine only
//! needs each recipe's per-item amounts at reference rate 1, which it reads
//! through the [`RecipeBook`] trait. [`RecipeCatalog`] is a small in-memory
//! implementation used by tests, fixtures and record loading.

use crate::id::{ItemId, RecipeId};
use crate::rational::Rational;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An item amount on one side of a recipe, per unit of reference rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeEntry {
    pub item: ItemId,
    pub amount: Rational,
}

impl RecipeEntry {
    pub fn new(item: ItemId, amount: Rational) -> Self {
        Self { item, amount }
    }
}

/// A recipe: the fixed ratios of a Craft node's pins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub inputs: Vec<RecipeEntry>,
    pub outputs: Vec<RecipeEntry>,
}

/// Read-only recipe lookup.
pub trait RecipeBook {
    fn recipe(&self, id: RecipeId) -> Option<&Recipe>;
}

/// A vector-backed recipe table with name lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeCatalog {
    recipes: Vec<Recipe>,
    #[serde(skip)]
    by_name: HashMap<String, RecipeId>,
}

impl RecipeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recipe and return its id. Re-registering a name replaces
    /// the earlier definition but keeps its id.
    pub fn register(
        &mut self,
        name: &str,
        inputs: Vec<RecipeEntry>,
        outputs: Vec<RecipeEntry>,
    ) -> RecipeId {
        let recipe = Recipe {
            name: name.to_string(),
            inputs,
            outputs,
        };
        if let Some(&id) = self.by_name.get(name) {
            self.recipes[id.0 as usize] = recipe;
            return id;
        }
        let id = RecipeId(self.recipes.len() as u32);
        self.recipes.push(recipe);
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn id_of(&self, name: &str) -> Option<RecipeId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// Rebuild the name index after deserialization.
    pub fn reindex(&mut self) {
        self.by_name = self
            .recipes
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), RecipeId(i as u32)))
            .collect();
    }
}

impl RecipeBook for RecipeCatalog {
    fn recipe(&self, id: RecipeId) -> Option<&Recipe> {
        self.recipes.get(id.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rational::ratio;

    fn smelting() -> (Vec<RecipeEntry>, Vec<RecipeEntry>) {
        (
            vec![RecipeEntry::new(ItemId(0), ratio(30, 1))],
            vec![RecipeEntry::new(ItemId(1), ratio(30, 1))],
        )
    }

    #[test]
    fn register_assigns_sequential_ids() {
        let mut catalog = RecipeCatalog::new();
        let (i, o) = smelting();
        let a = catalog.register("iron_ingot", i.clone(), o.clone());
        let b = catalog.register("copper_ingot", i, o);
        assert_eq!(a, RecipeId(0));
        assert_eq!(b, RecipeId(1));
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.id_of("copper_ingot"), Some(b));
    }

    #[test]
    fn reregister_replaces_in_place() {
        let mut catalog = RecipeCatalog::new();
        let (i, o) = smelting();
        let id = catalog.register("iron_ingot", i, o);
        let again = catalog.register("iron_ingot", vec![], vec![]);
        assert_eq!(id, again);
        assert!(catalog.recipe(id).unwrap().inputs.is_empty());
    }

    #[test]
    fn unknown_recipe_is_none() {
        let catalog = RecipeCatalog::new();
        assert!(catalog.recipe(RecipeId(3)).is_none());
        assert!(catalog.is_empty());
    }

    #[test]
    fn reindex_after_deserialize() {
        let mut catalog = RecipeCatalog::new();
        let (i, o) = smelting();
        catalog.register("iron_ingot", i, o);
        let json = serde_json::to_string(&catalog).unwrap();
        let mut loaded: RecipeCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.id_of("iron_ingot"), None);
        loaded.reindex();
        assert_eq!(loaded.id_of("iron_ingot"), Some(RecipeId(0)));
    }
}
