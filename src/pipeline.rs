//! The stages of a run, wired together through the files of a `Layout`.
//!
//! Every stage reads what the previous one saved, so any of them can be run
//! on its own and a run interrupted halfway picks up where it stopped.
//! Partial failures of a stage are kept in `warnings.json`; a stage whose
//! last run left warnings is never served from cache.

use crate::activity::{fetch_program_activity, fiscal_years};
use crate::api::{Clock, SpendingApi};
use crate::combine::{combine_awards, CombineOutcome, FUNDING, SUB_AWARDS, TRANSACTIONS};
use crate::compute::{reconcile, Reconciliation, Totals};
use crate::config::{Command, Config};
use crate::data::{AwardId, AwardOutcome, AwardStore, AwardTypeGroup, Error, ProgramActivity, Warning};
use crate::download::Downloader;
use crate::layout::{load_json, save_json, Layout};
use crate::read::read_ledger;
use crate::search::AwardSearch;
use crate::write::{render_report, write_table};
use anyhow::Context;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use tracing::{info, warn};

type StageWarnings = BTreeMap<String, Vec<Warning>>;
type DownloadStatus = BTreeMap<AwardId, AwardOutcome>;

pub struct Pipeline<'a> {
    config: &'a Config,
    layout: Layout,
    api: &'a dyn SpendingApi,
    clock: &'a dyn Clock,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, api: &'a dyn SpendingApi, clock: &'a dyn Clock) -> Result<Self, Error> {
        let layout = Layout::new(&config.output_dir, &config.tas, config.summary_name.as_deref());
        layout.create()?;
        Ok(Self {
            config,
            layout,
            api,
            clock,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Run one stage, or all of them; the reconciliation is returned when
    /// it was computed.
    pub async fn run(&self, command: Command) -> anyhow::Result<Option<Reconciliation>> {
        info!(tas = %self.config.tas, dir = %self.layout.root().display(), ?command, "Starting");
        match command {
            Command::Activity => {
                self.fetch_activity().await?;
            }
            Command::Search => {
                self.search().await?;
            }
            Command::Download => {
                self.download().await?;
            }
            Command::Combine => {
                self.combine()?;
            }
            Command::Reconcile => return Ok(Some(self.reconcile()?)),
            Command::Run => {
                self.fetch_activity().await?;
                self.search().await?;
                self.download().await?;
                self.combine()?;
                return Ok(Some(self.reconcile()?));
            }
        }
        Ok(None)
    }

    fn load_warnings(&self) -> Result<StageWarnings, Error> {
        Ok(load_json(&self.layout.warnings())?.unwrap_or_default())
    }

    fn record_warnings(&self, stage: &str, warnings: &[Warning]) -> Result<(), Error> {
        let mut all = self.load_warnings()?;
        if warnings.is_empty() {
            all.remove(stage);
        } else {
            all.insert(stage.to_string(), warnings.to_vec());
        }
        save_json(&self.layout.warnings(), &all)
    }

    fn is_cached(&self, stage: &str, path: &Path) -> Result<bool, Error> {
        Ok(!self.config.force && path.exists() && !self.load_warnings()?.contains_key(stage))
    }

    /// The program activity summary, one entry per fiscal year. Years that
    /// fail keep whatever an earlier run saved for them.
    pub async fn fetch_activity(&self) -> anyhow::Result<ProgramActivity> {
        let path = self.layout.program_activity();
        if self.is_cached("activity", &path)? {
            info!(path = %path.display(), "Program activity cached");
            return Ok(load_json(&path)?.unwrap_or_default());
        }
        let years = fiscal_years(self.config.first_fiscal_year, self.clock.now());
        let outcome = fetch_program_activity(
            self.api,
            self.clock,
            self.config.retry,
            &self.config.tas,
            years,
        )
        .await;
        let mut activity: ProgramActivity = load_json(&path)?.unwrap_or_default();
        activity.extend(outcome.activity);
        save_json(&path, &activity)?;
        self.record_warnings("activity", &outcome.warnings)?;
        Ok(activity)
    }

    pub async fn search(&self) -> anyhow::Result<AwardStore> {
        let path = self.layout.award_search();
        let filter_path = self.layout.award_search_filter();
        let mut award_ids = self.config.award_ids.clone();
        award_ids.sort();
        award_ids.dedup();
        let same_filter = load_json::<Vec<String>>(&filter_path)?.as_ref() == Some(&award_ids);
        if same_filter && self.is_cached("search", &path)? {
            info!(path = %path.display(), "Award search cached");
            return Ok(load_json(&path)?.unwrap_or_default());
        }
        let outcome = AwardSearch::new(
            self.api,
            self.clock,
            self.config.retry,
            &self.config.tas,
            &self.config.award_ids,
        )
        .search_all(&AwardTypeGroup::ALL)
        .await;
        save_json(&path, &outcome.awards)?;
        save_json(&filter_path, &award_ids)?;
        let mut warnings = outcome.warnings;
        warnings.extend(
            outcome
                .duplicates
                .iter()
                .map(|id| Warning::new(id.as_str(), "returned more than once, last copy kept")),
        );
        self.record_warnings("search", &warnings)?;
        let amount: Decimal = outcome.awards.values().filter_map(|a| a.amount()).sum();
        let earliest = outcome.awards.values().filter_map(|a| a.start_date()).min();
        info!(
            awards = outcome.awards.len(),
            %amount,
            earliest = earliest.unwrap_or("-"),
            "Awards found"
        );
        Ok(outcome.awards)
    }

    pub async fn download(&self) -> anyhow::Result<DownloadStatus> {
        let awards: AwardStore = load_json(&self.layout.award_search())?
            .context("no award search saved yet, run the `search` stage first")?;
        let status = Downloader::new(self.api, self.clock, &self.layout, self.config.download.clone())
            .download_all(&awards)
            .await;
        save_json(&self.layout.download_status(), &status)?;
        let failures: Vec<Warning> = status
            .iter()
            .filter_map(|(award_id, outcome)| match outcome {
                AwardOutcome::Failed { reason } => Some(Warning::new(award_id.as_str(), reason)),
                _ => None,
            })
            .collect();
        if !failures.is_empty() {
            warn!(failed = failures.len(), total = status.len(), "Some awards are not available");
        }
        self.record_warnings("download", &failures)?;
        Ok(status)
    }

    /// Rewrite the three combined tables from the available awards. The
    /// awards of the last download stage are used when there was one,
    /// otherwise every extraction found on disk.
    pub fn combine(&self) -> anyhow::Result<CombineOutcome> {
        let award_ids: Vec<AwardId> = match load_json::<DownloadStatus>(&self.layout.download_status())? {
            Some(status) => status
                .into_iter()
                .filter(|(_, outcome)| outcome.is_available())
                .map(|(award_id, _)| award_id)
                .collect(),
            None => self.layout.extracted_awards()?,
        };
        let outcome = combine_awards(&self.layout, &self.config.tas, &award_ids);
        for (tag, table) in [
            (FUNDING, &outcome.funding),
            (SUB_AWARDS, &outcome.sub_awards),
            (TRANSACTIONS, &outcome.transactions),
        ] {
            let path = self.layout.combined_table(tag);
            if table.headers.is_empty() {
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                continue;
            }
            write_table(File::create(&path)?, table)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        let obligated: Decimal = outcome.ledger.iter().map(|entry| entry.obligated).sum();
        info!(rows = outcome.ledger.len(), %obligated, "Funding table written");
        self.record_warnings("combine", &outcome.warnings)?;
        Ok(outcome)
    }

    /// Compare the saved summary with the combined funding table and write
    /// both the text and the JSON report.
    pub fn reconcile(&self) -> anyhow::Result<Reconciliation> {
        let activity: ProgramActivity = load_json(&self.layout.program_activity())?
            .context("no program activity saved yet, run the `activity` stage first")?;
        let (reference, mut warnings) = Totals::from_program_activity(&activity);

        let mut awards = Totals::new();
        let funding = self.layout.combined_table(FUNDING);
        if funding.exists() {
            let rows = read_ledger(File::open(&funding)?, &mut awards)
                .with_context(|| format!("reading {}", funding.display()))?;
            info!(rows, "Funding rows read");
        } else {
            warnings.push(Warning::new(FUNDING, "no combined funding table, awards count as zero"));
        }

        self.record_warnings("reconcile", &warnings)?;

        let mut report = reconcile(&self.config.tas, &reference, &awards)?;
        if let Some(status) = load_json::<DownloadStatus>(&self.layout.download_status())? {
            report.failed_awards = status
                .into_iter()
                .filter_map(|(award_id, outcome)| match outcome {
                    AwardOutcome::Failed { reason } => Some((award_id, reason)),
                    _ => None,
                })
                .collect();
        }
        for (stage, stage_warnings) in self.load_warnings()? {
            // failed downloads have their own section
            if stage == "download" {
                continue;
            }
            report.warnings.extend(stage_warnings.into_iter().map(|w| Warning {
                key: format!("{stage} {}", w.key),
                message: w.message,
            }));
        }

        fs::write(self.layout.report_text(), render_report(&report))?;
        save_json(&self.layout.report_json(), &report)?;
        info!(
            comparisons = report.comparisons.len(),
            failed_awards = report.failed_awards.len(),
            path = %self.layout.report_text().display(),
            "Reconciliation written"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeClock;
    use crate::api::{JobStatus, PageMetadata, SearchPage, SearchRequest, Submission};
    use crate::compute::Metric;
    use crate::data::{CategoryEntry, NoData, YearActivity};
    use crate::layout::fixtures::zip_archive;
    use crate::read::read_table;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const TAS: &str = "072-019-2024/2025-1031-000";

    /// A small usaspending.gov: FY2023 has a summary, three awards are
    /// booked on the TAS, one of them never finishes and one gets rate
    /// limited on its first poll.
    #[derive(Default)]
    struct SiteApi {
        awards: Vec<(AwardTypeGroup, &'static str)>,
        funding: HashMap<&'static str, String>,
        stuck: Vec<&'static str>,
        rate_limited_once: Vec<&'static str>,
        submits: Mutex<HashMap<String, usize>>,
        polls: Mutex<HashMap<String, usize>>,
        activity_calls: AtomicUsize,
        search_calls: AtomicUsize,
    }

    fn bump(counts: &Mutex<HashMap<String, usize>>, key: &str) -> usize {
        let mut counts = counts.lock().unwrap();
        let n = counts.entry(key.to_string()).or_default();
        *n += 1;
        *n - 1
    }

    impl SiteApi {
        fn submits(&self, award_id: &str) -> usize {
            self.submits.lock().unwrap().get(award_id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl SpendingApi for SiteApi {
        async fn search_awards(&self, request: &SearchRequest) -> Result<SearchPage, Error> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.filters.tas_codes.require, [[TAS]]);
            let results = self
                .awards
                .iter()
                .filter(|(group, _)| request.filters.award_type_codes == group.award_type_codes())
                .map(|(_, id)| {
                    let Value::Object(row) = json!({"generated_internal_id": id, "Award ID": id}) else {
                        unreachable!()
                    };
                    row
                })
                .collect::<Vec<Map<String, Value>>>();
            Ok(SearchPage {
                results,
                page_metadata: PageMetadata { has_next: false },
            })
        }

        async fn program_activity(&self, tas: &str, fiscal_year: i32) -> Result<YearActivity, Error> {
            self.activity_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(tas, TAS);
            let entry = |name: &str, obligated, outlay| CategoryEntry {
                name: name.into(),
                kind: None,
                obligated_amount: obligated,
                gross_outlay_amount: outlay,
                children: vec![],
            };
            Ok(match fiscal_year {
                2023 => YearActivity::Entries(vec![
                    entry("Personnel compensation and benefits", dec!(120000), dec!(100000)),
                    entry("Grants and fixed charges", dec!(290000000), dec!(250000000)),
                ]),
                _ => YearActivity::NoData(NoData {}),
            })
        }

        async fn submit_download(&self, award_id: &str, _: AwardTypeGroup) -> Result<Submission, Error> {
            bump(&self.submits, award_id);
            Ok(Submission {
                status_url: format!("status/{award_id}"),
                file_url: format!("file/{award_id}"),
            })
        }

        async fn job_status(&self, status_url: &str) -> Result<JobStatus, Error> {
            let award_id = status_url.trim_start_matches("status/");
            let n = bump(&self.polls, award_id);
            if self.stuck.iter().any(|id| *id == award_id) {
                return Ok(JobStatus::Pending);
            }
            if n == 0 && self.rate_limited_once.iter().any(|id| *id == award_id) {
                return Err(Error::RateLimited);
            }
            Ok(JobStatus::Ready { file_url: None })
        }

        async fn fetch_archive(&self, file_url: &str) -> Result<Vec<u8>, Error> {
            let award_id = file_url.trim_start_matches("file/");
            let funding_name = format!("{award_id}_{FUNDING}_1.csv");
            let sub_awards_name = format!("{award_id}_{SUB_AWARDS}_1.csv");
            Ok(zip_archive(&[
                (funding_name.as_str(), self.funding[award_id].as_str()),
                (sub_awards_name.as_str(), "subaward_number,amount\nS1,10\n"),
            ]))
        }
    }

    fn funding_csv(award_id: &str, rows: &[(&str, &str, &str, &str, &str)]) -> String {
        let mut csv = String::from(
            "award_id,treasury_account_symbol,submission_period,object_class_code,transaction_obligated_amount,gross_outlay_amount_FYB_to_period_end\n",
        );
        for (tas, period, class, obligated, outlay) in rows {
            csv.push_str(&format!("{award_id},{tas},{period},{class},{obligated},{outlay}\n"));
        }
        csv
    }

    fn site() -> SiteApi {
        SiteApi {
            awards: vec![
                (AwardTypeGroup::Grants, "ASST_A"),
                (AwardTypeGroup::Contracts, "CONT_B"),
                (AwardTypeGroup::Loans, "ASST_STUCK"),
            ],
            funding: HashMap::from([
                (
                    "ASST_A",
                    funding_csv(
                        "ASST_A",
                        &[
                            (TAS, "FY2023P01", "410", "290000000", "100000000"),
                            (TAS, "FY2023P02", "410", "0", "250000000"),
                            ("075-0512-2023-000", "FY2023P01", "410", "7", "7"),
                        ],
                    ),
                ),
                (
                    "CONT_B",
                    funding_csv("CONT_B", &[(TAS, "FY2023P03", "111", "120000", "100000")]),
                ),
                (
                    "ASST_STUCK",
                    funding_csv("ASST_STUCK", &[(TAS, "FY2023P01", "410", "5", "5")]),
                ),
            ]),
            stuck: vec!["ASST_STUCK"],
            rate_limited_once: vec!["CONT_B"],
            ..SiteApi::default()
        }
    }

    fn config(dir: &Path) -> Config {
        let mut config = Config::new(TAS, dir);
        config.first_fiscal_year = 2022;
        config.download.award_timeout = Duration::from_secs(600);
        config
    }

    #[tokio::test]
    async fn full_run_reconciles() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let api = site();
        let clock = FakeClock::new();
        let pipeline = Pipeline::new(&config, &api, &clock).unwrap();
        let report = pipeline.run(Command::Run).await.unwrap().unwrap();

        // FY2022 up to FY2026, the fiscal year running on 2026-02-01
        assert_eq!(api.activity_calls.load(Ordering::SeqCst), 5);
        let obligated = report.get(2023, None, Metric::Obligated).unwrap();
        assert_eq!(obligated.program_activity, dec!(290120000));
        assert_eq!(obligated.awards, dec!(290120000));
        assert_eq!(obligated.missing, Decimal::ZERO);
        assert_eq!(obligated.percent, Some(Decimal::ZERO));
        let outlay = report.get(2023, None, Metric::Outlay).unwrap();
        assert_eq!(outlay.awards, dec!(250100000));
        assert_eq!(outlay.missing, Decimal::ZERO);
        assert_eq!(report.get(2023, Some(1), Metric::Obligated).unwrap().awards, dec!(120000));

        // the stuck award is reported and left out of the combined table
        assert_eq!(report.failed_awards.keys().collect::<Vec<_>>(), ["ASST_STUCK"]);
        assert!(report.failed_awards["ASST_STUCK"].contains("timed out"));
        let funding = read_table(File::open(pipeline.layout().combined_table(FUNDING)).unwrap()).unwrap();
        assert_eq!(funding.rows.len(), 3);
        assert!(funding.rows.iter().all(|row| row[0] != "ASST_STUCK"));
        assert!(pipeline.layout().read_pending("ASST_STUCK").unwrap().is_some());

        // the rate limited award was submitted again after the cooldown
        assert_eq!(api.submits("CONT_B"), 2);
        assert!(clock.slept().contains(&Duration::from_secs(300)));

        let text = fs::read_to_string(pipeline.layout().report_text()).unwrap();
        assert!(text.contains("$290,120,000"));
        assert!(text.contains("  - ASST_STUCK: "));
        let json: Value = serde_json::from_slice(&fs::read(pipeline.layout().report_json()).unwrap()).unwrap();
        assert_eq!(json["tas"], TAS);
        let warnings: StageWarnings = load_json(&pipeline.layout().warnings()).unwrap().unwrap();
        assert_eq!(warnings.keys().collect::<Vec<_>>(), ["download"]);
    }

    #[tokio::test]
    async fn second_run_reuses_saved_stages() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let api = site();
        let clock = FakeClock::new();
        let pipeline = Pipeline::new(&config, &api, &clock).unwrap();
        pipeline.run(Command::Run).await.unwrap();
        let funding_path = pipeline.layout().combined_table(FUNDING);
        let first = fs::read(&funding_path).unwrap();
        let searches = api.search_calls.load(Ordering::SeqCst);

        let again = pipeline.run(Command::Run).await.unwrap().unwrap();
        assert_eq!(api.activity_calls.load(Ordering::SeqCst), 5);
        assert_eq!(api.search_calls.load(Ordering::SeqCst), searches);
        // extracted awards are fresh, the stuck one resumes its pending job
        assert_eq!(api.submits("ASST_A"), 1);
        assert_eq!(api.submits("CONT_B"), 2);
        assert_eq!(api.submits("ASST_STUCK"), 1);
        assert_eq!(fs::read(&funding_path).unwrap(), first);
        assert_eq!(again.get(2023, None, Metric::Obligated).unwrap().missing, Decimal::ZERO);
    }

    #[tokio::test]
    async fn force_fetches_again() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        let api = SiteApi::default();
        let clock = FakeClock::new();
        Pipeline::new(&config, &api, &clock)
            .unwrap()
            .run(Command::Activity)
            .await
            .unwrap();
        config.force = true;
        let pipeline = Pipeline::new(&config, &api, &clock).unwrap();
        pipeline.run(Command::Activity).await.unwrap();
        pipeline.run(Command::Search).await.unwrap();
        assert_eq!(api.activity_calls.load(Ordering::SeqCst), 10);
        assert_eq!(
            api.search_calls.load(Ordering::SeqCst),
            AwardTypeGroup::ALL.len()
        );
    }

    #[tokio::test]
    async fn stages_need_their_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let api = SiteApi::default();
        let clock = FakeClock::new();
        let pipeline = Pipeline::new(&config, &api, &clock).unwrap();
        assert!(pipeline.run(Command::Download).await.is_err());
        assert!(pipeline.run(Command::Reconcile).await.is_err());

        // nothing extracted: the summary is compared against zero
        pipeline.run(Command::Activity).await.unwrap();
        pipeline.run(Command::Combine).await.unwrap();
        assert!(!pipeline.layout().combined_table(FUNDING).exists());
        let report = pipeline.run(Command::Reconcile).await.unwrap().unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].key, format!("reconcile {FUNDING}"));
        assert!(report.failed_awards.is_empty());
    }

    #[tokio::test]
    async fn unmapped_summary_year_still_gets_a_report() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let api = SiteApi::default();
        let clock = FakeClock::new();
        let pipeline = Pipeline::new(&config, &api, &clock).unwrap();
        let entry = |name: &str, amount: Decimal| CategoryEntry {
            name: name.into(),
            kind: None,
            obligated_amount: amount,
            gross_outlay_amount: amount,
            children: vec![],
        };
        let activity = ProgramActivity::from([
            ("2022".to_string(), YearActivity::Entries(vec![entry("Refunds", dec!(3))])),
            (
                "2023".to_string(),
                YearActivity::Entries(vec![entry("Grants and fixed charges", dec!(10))]),
            ),
        ]);
        save_json(&pipeline.layout().program_activity(), &activity).unwrap();

        let report = pipeline.run(Command::Reconcile).await.unwrap().unwrap();
        assert!(pipeline.layout().report_text().exists());
        assert!(pipeline.layout().report_json().exists());
        assert!(report.comparisons.iter().all(|c| c.fiscal_year == 2023));
        let keys: Vec<_> = report.warnings.iter().map(|w| w.key.clone()).collect();
        assert_eq!(keys, ["reconcile 2022".to_string(), format!("reconcile {FUNDING}")]);
    }

    #[tokio::test]
    async fn changed_award_filter_searches_again() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        let api = SiteApi::default();
        let clock = FakeClock::new();
        let groups = AwardTypeGroup::ALL.len();

        config.award_ids = vec!["B".into(), "A".into()];
        let pipeline = Pipeline::new(&config, &api, &clock).unwrap();
        pipeline.run(Command::Search).await.unwrap();
        pipeline.run(Command::Search).await.unwrap();
        assert_eq!(api.search_calls.load(Ordering::SeqCst), groups);

        // same ids in another order reuse the saved search
        config.award_ids = vec!["A".into(), "B".into(), "A".into()];
        Pipeline::new(&config, &api, &clock)
            .unwrap()
            .run(Command::Search)
            .await
            .unwrap();
        assert_eq!(api.search_calls.load(Ordering::SeqCst), groups);

        config.award_ids = vec!["C".into()];
        Pipeline::new(&config, &api, &clock)
            .unwrap()
            .run(Command::Search)
            .await
            .unwrap();
        assert_eq!(api.search_calls.load(Ordering::SeqCst), 2 * groups);
    }
}
