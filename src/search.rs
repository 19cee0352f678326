use crate::api::{
    Clock, RetryPolicy, SearchFilters, SearchRequest, SpendingApi, TasFilter, PAGE_SIZE,
};
use crate::data::{AwardRecord, AwardStore, AwardTypeGroup, Error, Warning};
use tracing::{info, warn};

/// Result of searching every award type group.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub awards: AwardStore,
    /// Ids returned more than once; the last copy was kept.
    pub duplicates: Vec<String>,
    /// Groups whose search failed.
    pub warnings: Vec<Warning>,
}

pub struct AwardSearch<'a> {
    api: &'a dyn SpendingApi,
    clock: &'a dyn Clock,
    retry: RetryPolicy,
    tas: String,
    award_ids: Vec<String>,
}

impl<'a> AwardSearch<'a> {
    pub fn new(
        api: &'a dyn SpendingApi,
        clock: &'a dyn Clock,
        retry: RetryPolicy,
        tas: &str,
        award_ids: &[String],
    ) -> Self {
        Self {
            api,
            clock,
            retry,
            tas: tas.to_string(),
            award_ids: award_ids.to_vec(),
        }
    }

    fn request(&self, group: AwardTypeGroup, page: u32) -> SearchRequest {
        SearchRequest {
            filters: SearchFilters {
                tas_codes: TasFilter {
                    require: vec![vec![self.tas.clone()]],
                },
                award_type_codes: group
                    .award_type_codes()
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
                award_ids: self.award_ids.clone(),
            },
            fields: group.fields().into_iter().map(String::from).collect(),
            limit: PAGE_SIZE,
            page,
        }
    }

    /// Page through one award type group until the API says there is no
    /// next page, or a page comes back short. Records are merged into `out`
    /// only once every page of the group was read.
    pub async fn search_award_type(
        &self,
        group: AwardTypeGroup,
        out: &mut SearchOutcome,
    ) -> Result<usize, Error> {
        let mut page = 1;
        let mut records = Vec::new();
        loop {
            let request = self.request(group, page);
            let request = &request;
            let api = self.api;
            let result = self
                .retry
                .run(self.clock, "award search", move || api.search_awards(request))
                .await?;
            let rows = result.results.len();
            for row in result.results {
                records.push(AwardRecord::from_row(group, row)?);
            }
            if !result.page_metadata.has_next || rows < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        let found = records.len();
        for record in records {
            let id = record.generated_internal_id.clone();
            if out.awards.insert(id.clone(), record).is_some() {
                warn!(award_id = %id, group = group.label(), "Award returned twice");
                out.duplicates.push(id);
            }
        }
        info!(group = group.label(), found, pages = page, "Award search done");
        Ok(found)
    }

    /// Search every group; a failing group is reported and skipped.
    pub async fn search_all(&self, groups: &[AwardTypeGroup]) -> SearchOutcome {
        let mut out = SearchOutcome::default();
        for &group in groups {
            if let Err(e) = self.search_award_type(group, &mut out).await {
                warn!(group = group.label(), error = %e, "Award search failed");
                out.warnings.push(Warning::new(group.label(), &e));
            }
        }
        out
    }
}
