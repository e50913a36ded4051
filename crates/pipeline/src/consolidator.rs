//! Identity consolidation.
//!
//! Runs on a fixed period, decoupled from frame rate. Each pass drains the
//! unconsumed observations into alias groups, picks the best-quality
//! exemplar per group, resolves it against the owner's gallery, upserts the
//! canonical identity, appends a visit, and dispatches a notification. The
//! group's rows are deleted only after all of that succeeds; a failed group
//! stays in place and is retried on the next pass.
//!
//! Passes serialize on an internal lock: when several streams share one
//! consolidator, overlapping ticks cannot fetch the same rows and consume a
//! group twice.

use crate::notify::Notifier;
use crate::PipelineError;
use facewatch_core::quality;
use facewatch_core::types::{FirstMatchMatcher, Matcher};
use facewatch_core::FaceDetector;
use facewatch_store::{FaceStore, TransientObservation};
use std::sync::{Arc, Mutex};

/// Upper bound on observations consolidated as one group. A long dwell in
/// front of the camera is chopped into multiple visits rather than one
/// unbounded group.
pub const MAX_GROUP_SIZE: usize = 15;

/// Euclidean distance below which a probe is the same person as a gallery
/// entry.
pub const MATCH_THRESHOLD: f32 = 0.6;

/// What one consolidation pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassSummary {
    pub groups_processed: usize,
    pub groups_failed: usize,
    pub observations_consumed: usize,
}

pub struct Consolidator {
    store: Arc<FaceStore>,
    detector: Arc<dyn FaceDetector>,
    matcher: Box<dyn Matcher + Send + Sync>,
    notifier: Notifier,
    owner_id: i64,
    max_group_size: usize,
    match_threshold: f32,
    pass_lock: Mutex<()>,
}

impl Consolidator {
    pub fn new(
        store: Arc<FaceStore>,
        detector: Arc<dyn FaceDetector>,
        notifier: Notifier,
        owner_id: i64,
    ) -> Self {
        Self {
            store,
            detector,
            matcher: Box::new(FirstMatchMatcher),
            notifier,
            owner_id,
            max_group_size: MAX_GROUP_SIZE,
            match_threshold: MATCH_THRESHOLD,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn with_matcher(mut self, matcher: Box<dyn Matcher + Send + Sync>) -> Self {
        self.matcher = matcher;
        self
    }

    /// One consolidation pass over everything currently unconsumed. A pass
    /// that starts while another runs waits its turn and sees only what the
    /// first left behind.
    pub fn run_pass(&self) -> Result<PassSummary, PipelineError> {
        let _pass = match self.pass_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let observations = self.store.unconsumed_observations(self.owner_id)?;
        let mut summary = PassSummary::default();
        if observations.is_empty() {
            return Ok(summary);
        }

        for group in split_groups(&observations, self.max_group_size) {
            match self.consolidate_group(group) {
                Ok(consumed) => {
                    summary.groups_processed += 1;
                    summary.observations_consumed += consumed;
                }
                Err(err) => {
                    summary.groups_failed += 1;
                    tracing::error!(
                        owner_id = self.owner_id,
                        alias = %group[0].alias,
                        size = group.len(),
                        error = %err,
                        "consolidation group failed, will retry next pass"
                    );
                }
            }
        }

        tracing::debug!(
            owner_id = self.owner_id,
            groups = summary.groups_processed,
            failed = summary.groups_failed,
            consumed = summary.observations_consumed,
            "consolidation pass finished"
        );
        Ok(summary)
    }

    /// Consolidate one alias group. Returns the number of rows consumed.
    fn consolidate_group(&self, group: &[TransientObservation]) -> Result<usize, PipelineError> {
        let ids: Vec<i64> = group.iter().map(|o| o.id).collect();

        // Score every decodable observation; a corrupt image skips scoring
        // only, never the group.
        let mut best: Option<(&TransientObservation, f64)> = None;
        for obs in group {
            let score = match quality::score_jpeg(&obs.image, self.detector.as_ref()) {
                Ok(score) => score,
                Err(err) => {
                    tracing::warn!(observation = obs.id, error = %err, "unscorable observation skipped");
                    continue;
                }
            };
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((obs, score));
            }
        }

        let Some((exemplar, score)) = best else {
            // Nothing in the group decodes; retrying cannot help.
            tracing::warn!(
                alias = %group[0].alias,
                size = group.len(),
                "no scorable observation in group, discarding"
            );
            return Ok(self.store.delete_observations(&ids)?);
        };

        // Resolve against every canonical identity the owner has, so a
        // returning face folds into its existing record instead of minting
        // a new alias-bound one.
        let gallery = self.store.gallery(self.owner_id)?;
        let matched = self
            .matcher
            .find_match(&exemplar.embedding, &gallery, self.match_threshold);
        let target_alias = matched.map_or(exemplar.alias.as_str(), |e| e.alias.as_str());

        let (identity, created) = self.store.get_or_create_identity(
            self.owner_id,
            target_alias,
            exemplar.captured_at.date_naive(),
            &exemplar.image,
            &exemplar.embedding,
            score,
            exemplar.captured_at,
        )?;
        if created {
            tracing::info!(
                owner_id = self.owner_id,
                alias = target_alias,
                quality = score,
                matched = matched.is_some(),
                "canonical identity created"
            );
        } else if score >= identity.quality_score {
            self.store.update_identity_exemplar(
                identity.id,
                &exemplar.image,
                &exemplar.embedding,
                score,
                exemplar.captured_at,
            )?;
            tracing::debug!(
                identity = identity.id,
                old_quality = identity.quality_score,
                new_quality = score,
                "exemplar upgraded"
            );
        }

        self.store
            .insert_visit(identity.id, &exemplar.image, exemplar.captured_at)?;
        self.notifier.notify(
            self.owner_id,
            &identity.alias,
            exemplar.captured_at,
            &exemplar.image,
        )?;

        // Delete exactly the rows this pass saw; observations written for
        // the same alias during the pass survive to the next one.
        Ok(self.store.delete_observations(&ids)?)
    }
}

/// Split observations (already sorted by alias) into contiguous alias runs,
/// with a forced boundary every `max` rows.
fn split_groups(observations: &[TransientObservation], max: usize) -> Vec<&[TransientObservation]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=observations.len() {
        let boundary = i == observations.len()
            || observations[i].alias != observations[start].alias
            || i - start >= max;
        if boundary {
            groups.push(&observations[start..i]);
            start = i;
        }
    }
    groups
}
