//! Taxa and taxa lists.

use crate::storage_manager::{compound_key, StorageManager};
use common::models::{TaxaList, Taxon, TaxonRank};
use common::{DbResult, TaxaListId, TaxonId};

impl StorageManager {
    /// Finds the taxon called `name` or atomically creates it with rank
    /// `Unknown`.
    pub fn get_or_create_taxon(&self, name: &str) -> DbResult<(Taxon, bool)> {
        Self::find_or_create(
            &self.taxa,
            &self.taxon_names,
            name.as_bytes(),
            || Taxon::new(name, TaxonRank::Unknown),
            |taxon| taxon.id.as_bytes().to_vec(),
        )
    }

    pub fn get_taxon(&self, id: &TaxonId) -> DbResult<Option<Taxon>> {
        Self::get_record(&self.taxa, id.as_bytes())
    }

    pub fn get_taxon_by_name(&self, name: &str) -> DbResult<Option<Taxon>> {
        match self.taxon_names.get(name.as_bytes())? {
            Some(id) => Self::get_record(&self.taxa, &id),
            None => Ok(None),
        }
    }

    pub fn count_taxa(&self) -> usize {
        self.taxa.len()
    }

    /// Finds the taxa list called `name` or atomically creates it.
    pub fn get_or_create_taxa_list(&self, name: &str) -> DbResult<(TaxaList, bool)> {
        Self::find_or_create(
            &self.taxa_lists,
            &self.taxa_list_names,
            name.as_bytes(),
            || TaxaList::new(name),
            |list| list.id.as_bytes().to_vec(),
        )
    }

    pub fn get_taxa_list_by_name(&self, name: &str) -> DbResult<Option<TaxaList>> {
        match self.taxa_list_names.get(name.as_bytes())? {
            Some(id) => Self::get_record(&self.taxa_lists, &id),
            None => Ok(None),
        }
    }

    /// Adds a taxon to a list. Returns `true` if it was not a member yet.
    pub fn add_taxon_to_list(&self, list: &TaxaListId, taxon: &TaxonId) -> DbResult<bool> {
        let key = compound_key(&[list.as_bytes(), taxon.as_bytes()]);
        let previous = self.taxa_list_members.insert(key, &[] as &[u8])?;
        Ok(previous.is_none())
    }

    /// Members of a taxa list, in id order.
    pub fn taxa_in_list(&self, list: &TaxaListId) -> DbResult<Vec<Taxon>> {
        Self::related_records(&self.taxa_list_members, &self.taxa, list.as_bytes())
    }
}
