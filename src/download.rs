//! Bulk download of every award's transaction archive.
//!
//! Each award walks its own state machine:
//!
//! ```text
//! NotRequested -> Submitted -> Polling -> Ready -> Extracted
//!                     |           |
//!                     +--> RateLimited --(cooldown)--> resubmit
//! ```
//!
//! and ends either `Extracted` or `Failed`. Jobs are kept in a working set and
//! the one due first is advanced, so a slow award never holds up the others.
//! At most `max_outstanding` jobs are in flight with the provider.

use crate::api::{Clock, JobStatus, RetryPolicy, SpendingApi, Submission};
use crate::data::{AwardId, AwardOutcome, AwardStore, AwardTypeGroup, Error};
use crate::layout::Layout;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub poll_interval: Duration,
    pub rate_limit_cooldown: Duration,
    /// Budget of one award, from its first submission to its extraction.
    pub award_timeout: Duration,
    pub max_outstanding: usize,
    /// Extractions older than this are downloaded again.
    pub refresh_before: Option<DateTime<Utc>>,
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            rate_limit_cooldown: Duration::from_secs(300),
            award_timeout: Duration::from_secs(2 * 60 * 60),
            max_outstanding: 4,
            refresh_before: None,
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(1),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    NotRequested,
    Submitted(Submission),
    Polling(Submission),
    /// Waiting out the provider's cooldown before submitting again.
    RateLimited,
    Ready { file_url: String },
    Extracted { at: DateTime<Utc>, fresh: bool },
    Failed(String),
}

impl DownloadState {
    fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Extracted { .. } | DownloadState::Failed(_))
    }
}

#[derive(Debug)]
struct Job {
    award_id: AwardId,
    group: AwardTypeGroup,
    state: DownloadState,
    due: DateTime<Utc>,
    started: Option<DateTime<Utc>>,
}

impl Job {
    fn outcome(&self) -> AwardOutcome {
        match &self.state {
            DownloadState::Extracted { at, fresh: true } => AwardOutcome::Fresh { at: *at },
            DownloadState::Extracted { at, fresh: false } => AwardOutcome::Extracted { at: *at },
            DownloadState::Failed(reason) => AwardOutcome::Failed {
                reason: reason.clone(),
            },
            other => AwardOutcome::Failed {
                reason: format!("stopped in state {other:?}"),
            },
        }
    }
}

fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    at + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
}

pub struct Downloader<'a> {
    api: &'a dyn SpendingApi,
    clock: &'a dyn Clock,
    layout: &'a Layout,
    config: DownloadConfig,
}

impl<'a> Downloader<'a> {
    pub fn new(
        api: &'a dyn SpendingApi,
        clock: &'a dyn Clock,
        layout: &'a Layout,
        config: DownloadConfig,
    ) -> Self {
        Self {
            api,
            clock,
            layout,
            config,
        }
    }

    fn is_fresh(&self, downloaded_at: DateTime<Utc>) -> bool {
        self.config
            .refresh_before
            .map_or(true, |threshold| downloaded_at >= threshold)
    }

    /// Drive every award to `Extracted` or `Failed`. Failures never stop the
    /// other awards.
    pub async fn download_all(&self, awards: &AwardStore) -> BTreeMap<AwardId, AwardOutcome> {
        let start = self.clock.now();
        let mut jobs: VecDeque<Job> = awards
            .values()
            .map(|award| Job {
                award_id: award.generated_internal_id.clone(),
                group: award.award_type_group,
                state: DownloadState::NotRequested,
                due: start,
                started: None,
            })
            .collect();
        let total = jobs.len();
        let mut outcomes = BTreeMap::new();

        while !jobs.is_empty() {
            let outstanding = jobs
                .iter()
                .filter(|job| job.state != DownloadState::NotRequested)
                .count();
            let can_submit = outstanding < self.config.max_outstanding.max(1);
            let Some(index) = jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| can_submit || job.state != DownloadState::NotRequested)
                .min_by_key(|(_, job)| job.due)
                .map(|(index, _)| index)
            else {
                break;
            };
            let Some(mut job) = jobs.remove(index) else {
                break;
            };

            let now = self.clock.now();
            if job.due > now {
                self.clock
                    .sleep((job.due - now).to_std().unwrap_or_default())
                    .await;
            }
            self.step(&mut job).await;

            if job.state.is_terminal() {
                let outcome = job.outcome();
                match &outcome {
                    AwardOutcome::Failed { reason } => {
                        warn!(award_id = %job.award_id, reason = %reason, "Award download failed")
                    }
                    _ => info!(
                        award_id = %job.award_id,
                        done = outcomes.len() + 1,
                        total,
                        "Award available"
                    ),
                }
                outcomes.insert(job.award_id, outcome);
            } else {
                jobs.push_back(job);
            }
        }
        outcomes
    }

    async fn step(&self, job: &mut Job) {
        if let Err(e) = self.advance(job).await {
            job.state = DownloadState::Failed(e.to_string());
        }
    }

    /// Move one job by one transition.
    async fn advance(&self, job: &mut Job) -> Result<(), Error> {
        let now = self.clock.now();
        let state = std::mem::replace(&mut job.state, DownloadState::NotRequested);
        job.state = match state {
            DownloadState::NotRequested => {
                if let Some(at) = self.layout.read_marker(&job.award_id)? {
                    if self.is_fresh(at) {
                        debug!(award_id = %job.award_id, %at, "Extraction still fresh");
                        job.state = DownloadState::Extracted { at, fresh: true };
                        return Ok(());
                    }
                }
                job.started.get_or_insert(now);
                if let Some(submission) = self.layout.read_pending(&job.award_id)? {
                    info!(award_id = %job.award_id, "Resuming pending download");
                    job.due = now;
                    DownloadState::Polling(submission)
                } else {
                    self.submit(job, now).await?
                }
            }
            DownloadState::Submitted(submission) => {
                self.layout.write_pending(&job.award_id, &submission)?;
                job.due = after(now, self.config.poll_interval);
                DownloadState::Polling(submission)
            }
            DownloadState::Polling(submission) => {
                self.check_timeout(job, now)?;
                self.poll(job, submission, now).await?
            }
            DownloadState::RateLimited => {
                self.check_timeout(job, now)?;
                self.submit(job, now).await?
            }
            DownloadState::Ready { file_url } => self.fetch(job, &file_url, now).await?,
            done @ (DownloadState::Extracted { .. } | DownloadState::Failed(_)) => done,
        };
        Ok(())
    }

    fn check_timeout(&self, job: &Job, now: DateTime<Utc>) -> Result<(), Error> {
        let elapsed = (now - job.started.unwrap_or(now))
            .to_std()
            .unwrap_or_default();
        if elapsed > self.config.award_timeout {
            return Err(Error::Timeout {
                award_id: job.award_id.clone(),
                elapsed,
            });
        }
        Ok(())
    }

    async fn submit(&self, job: &mut Job, now: DateTime<Utc>) -> Result<DownloadState, Error> {
        let (api, award_id, group) = (self.api, job.award_id.as_str(), job.group);
        let submitted = self
            .config
            .retry
            .run(self.clock, "download submission", move || {
                api.submit_download(award_id, group)
            })
            .await;
        match submitted {
            Ok(submission) => {
                info!(award_id = %job.award_id, status_url = %submission.status_url, "Download submitted");
                job.due = now;
                Ok(DownloadState::Submitted(submission))
            }
            Err(Error::RateLimited) => Ok(self.cool_down(job, now)),
            Err(e) => Err(e),
        }
    }

    fn cool_down(&self, job: &mut Job, now: DateTime<Utc>) -> DownloadState {
        warn!(
            award_id = %job.award_id,
            cooldown = ?self.config.rate_limit_cooldown,
            "Rate limited, resubmitting after cooldown"
        );
        job.due = after(now, self.config.rate_limit_cooldown);
        DownloadState::RateLimited
    }

    async fn poll(
        &self,
        job: &mut Job,
        submission: Submission,
        now: DateTime<Utc>,
    ) -> Result<DownloadState, Error> {
        let (api, status_url) = (self.api, submission.status_url.as_str());
        let status = self
            .config
            .retry
            .run(self.clock, "download status", move || api.job_status(status_url))
            .await;
        match status {
            Ok(JobStatus::Pending) => {
                debug!(award_id = %job.award_id, "Download still running");
                job.due = after(now, self.config.poll_interval);
                Ok(DownloadState::Polling(submission))
            }
            Ok(JobStatus::Ready { file_url }) => {
                job.due = now;
                Ok(DownloadState::Ready {
                    file_url: file_url.unwrap_or(submission.file_url),
                })
            }
            Ok(JobStatus::Failed(message)) => {
                self.layout.clear_pending(&job.award_id)?;
                Err(Error::Schema(format!("provider failed the download: {message}")))
            }
            Err(Error::RateLimited) => {
                self.layout.clear_pending(&job.award_id)?;
                Ok(self.cool_down(job, now))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch(
        &self,
        job: &mut Job,
        file_url: &str,
        now: DateTime<Utc>,
    ) -> Result<DownloadState, Error> {
        let api = self.api;
        let bytes = self
            .config
            .retry
            .run(self.clock, "archive download", move || api.fetch_archive(file_url))
            .await?;
        let extracted = self.layout.extract_archive(&job.award_id, &bytes);
        // a broken archive will not get better by polling the same job
        self.layout.clear_pending(&job.award_id)?;
        let dir = extracted?;
        self.layout.write_marker(&job.award_id, now)?;
        info!(award_id = %job.award_id, dir = %dir.display(), "Award extracted");
        Ok(DownloadState::Extracted { at: now, fresh: false })
    }
}
