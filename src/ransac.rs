//! The consensus controller: hypothesize-and-verify main loop in a
//! single-threaded and a parallel flavor.
//!
//! The controller owns a monotonically improving best score and feeds it
//! back into the quality (early-exit bound), the verifier (SPRT re-design)
//! and the termination criterion (iteration cap). The parallel variant runs
//! one worker per thread over pre-cloned resource sets and synchronizes
//! scores every tenth iteration.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;

use crate::degeneracy::Degeneracy;
use crate::error::EstimateError;
use crate::local_optimization::{LocalOptimization, ModelPolisher};
use crate::quality::{Quality, Score};
use crate::samplers::Sampler;
use crate::settings::{LocalOptimMethod, Params, SamplingMethod};
use crate::solvers::Estimator;
use crate::termination::TerminationCriteria;
use crate::types::{Model, PointSet};
use crate::verifier::ModelVerifier;

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RansacOutput {
    pub model: Model,
    /// Per-point inlier flags; empty when the mask was not requested.
    pub inliers_mask: Vec<bool>,
    pub inlier_number: usize,
    pub iterations: usize,
    pub time_micros: u128,
    pub cost: f64,
}

impl RansacOutput {
    /// Indices of the inliers, derived from the mask.
    pub fn inliers(&self) -> Vec<usize> {
        self.inliers_mask
            .iter()
            .enumerate()
            .filter_map(|(i, &flag)| flag.then_some(i))
            .collect()
    }

    /// Mask as 0/1 bytes.
    pub fn mask_bytes(&self) -> Vec<u8> {
        self.inliers_mask.iter().map(|&f| f as u8).collect()
    }
}

/// Per-worker resource set, cloned before the parallel region starts.
struct WorkerSet {
    tid: usize,
    estimator: Estimator,
    quality: Box<dyn Quality>,
    verifier: Box<dyn ModelVerifier>,
    degeneracy: Box<dyn Degeneracy>,
    local_optimization: Option<Box<dyn LocalOptimization>>,
    termination: Box<dyn TerminationCriteria>,
    /// `None` when the global PROSAC sampler is shared instead.
    sampler: Option<Box<dyn Sampler>>,
}

/// The consensus engine.
pub struct Ransac {
    params: Params,
    points: Arc<PointSet>,
    estimator: Estimator,
    quality: Box<dyn Quality>,
    sampler: Box<dyn Sampler>,
    termination: Box<dyn TerminationCriteria>,
    verifier: Box<dyn ModelVerifier>,
    degeneracy: Box<dyn Degeneracy>,
    local_optimization: Option<Box<dyn LocalOptimization>>,
    polisher: Option<Box<dyn ModelPolisher>>,
    state: u64,
    parallel: bool,
}

impl Ransac {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: Params,
        points: Arc<PointSet>,
        estimator: Estimator,
        quality: Box<dyn Quality>,
        sampler: Box<dyn Sampler>,
        termination: Box<dyn TerminationCriteria>,
        verifier: Box<dyn ModelVerifier>,
        degeneracy: Box<dyn Degeneracy>,
        local_optimization: Option<Box<dyn LocalOptimization>>,
        polisher: Option<Box<dyn ModelPolisher>>,
        parallel: bool,
        state: u64,
    ) -> Self {
        Self {
            params,
            points,
            estimator,
            quality,
            sampler,
            termination,
            verifier,
            degeneracy,
            local_optimization,
            polisher,
            state,
            parallel,
        }
    }

    /// Run the configured loop, polish the winner and assemble the output.
    pub fn run(&mut self) -> Result<RansacOutput, EstimateError> {
        let sample_size = self.estimator.sample_size();
        if self.points.len() < sample_size {
            return Err(EstimateError::InsufficientData {
                required: sample_size,
                actual: self.points.len(),
            });
        }

        let begin = Instant::now();
        let (best_model, mut best_score, final_iters) = if self.parallel {
            self.run_parallel()
        } else {
            self.run_single()
        };

        let Some(mut model) = best_model else {
            return Err(EstimateError::ZeroInliers);
        };
        if best_score.inlier_number == 0 {
            return Err(EstimateError::ZeroInliers);
        }

        if let Some(polisher) = self.polisher.as_mut() {
            if let Some((polished, polished_score)) = polisher.polish(&model, &best_score) {
                if polished_score.is_better(&best_score) {
                    model = polished;
                    best_score = polished_score;
                }
            }
        }

        let mut inliers_mask = Vec::new();
        if self.params.need_mask {
            inliers_mask = vec![false; self.points.len()];
            self.quality.inliers_mask(&model, &mut inliers_mask);
        }

        debug!(
            "consensus finished: {} inliers, cost {:.3}, {} iterations",
            best_score.inlier_number, best_score.cost, final_iters
        );
        Ok(RansacOutput {
            model,
            inliers_mask,
            inlier_number: best_score.inlier_number,
            iterations: final_iters,
            time_micros: begin.elapsed().as_micros(),
            cost: best_score.cost,
        })
    }

    fn run_single(&mut self) -> (Option<Model>, Score, usize) {
        let is_magsac = self.params.local_optimization == LocalOptimMethod::Sigma;
        let lo_enabled = self.local_optimization.is_some();

        let mut best_model: Option<Model> = None;
        let mut best_score = Score::worst();
        let mut sample = vec![0usize; self.estimator.sample_size()];
        let mut models: Vec<Model> = Vec::with_capacity(self.estimator.max_solutions());
        let mut recovered = Model::zeros(3, 3);
        let mut recovered_score = Score::worst();

        let mut max_iters = self.params.max_iterations;
        let mut iters = 0usize;

        while iters < max_iters {
            self.sampler.generate_sample(&mut sample);
            let n_models = self.estimator.estimate_models(&sample, &mut models);

            for i in 0..n_models {
                if !self.verifier.is_model_good(&mut *self.quality, &models[i]) {
                    continue;
                }

                let current_score = if is_magsac {
                    if best_model.is_none() {
                        best_model = Some(models[i].clone());
                    }
                    let lo = self
                        .local_optimization
                        .as_mut()
                        .expect("sigma mode carries a refiner");
                    lo.refine_with_candidate(
                        best_model.as_ref().expect("seeded above"),
                        &best_score,
                        &models[i],
                    )
                } else if let Some(score) = self.verifier.last_score() {
                    score
                } else {
                    self.quality.score(&models[i])
                };

                if !current_score.is_better(&best_score) {
                    continue;
                }

                if self.degeneracy.recover_if_degenerate(
                    &sample,
                    &models[i],
                    &mut recovered,
                    &mut recovered_score,
                ) {
                    // A degenerate candidate is only kept through its
                    // repaired replacement.
                    if recovered_score.is_better(&best_score) {
                        best_score = recovered_score;
                        best_model = Some(recovered.clone());
                    } else {
                        continue;
                    }
                } else {
                    best_score = current_score;
                    best_model = Some(models[i].clone());
                }

                self.quality.set_best_score(best_score.cost);
                max_iters = self
                    .termination
                    .update(best_model.as_ref().expect("just set"), best_score.inlier_number);
                if iters > max_iters {
                    break;
                }

                if lo_enabled && !is_magsac {
                    let lo = self.local_optimization.as_mut().expect("checked above");
                    let refined = lo.refine(best_model.as_ref().expect("just set"), &best_score);
                    if let Some((lo_model, lo_score)) = refined {
                        if lo_score.is_better(&best_score) {
                            best_score = lo_score;
                            best_model = Some(lo_model);

                            self.quality.set_best_score(best_score.cost);
                            self.verifier.update(best_score.inlier_number);
                            max_iters = self.termination.update(
                                best_model.as_ref().expect("just set"),
                                best_score.inlier_number,
                            );
                            if iters > max_iters {
                                break;
                            }
                        }
                    }
                }
            }

            iters += 1;
        }

        (best_model, best_score, iters)
    }

    fn run_parallel(&mut self) -> (Option<Model>, Score, usize) {
        let threads = rayon::current_num_threads().max(1);
        let is_prosac = self.params.sampler == SamplingMethod::Prosac;
        let is_magsac = self.params.local_optimization == LocalOptimMethod::Sigma;
        let lo_enabled = self.local_optimization.is_some();
        let max_iterations = self.params.max_iterations;

        let success = AtomicBool::new(false);
        let num_hypothesis_tested = AtomicUsize::new(0);
        let best_slots: Vec<Mutex<(Score, Option<Model>)>> = (0..threads)
            .map(|_| Mutex::new((Score::worst(), None)))
            .collect();

        // Per-thread resources are acquired before the region starts; the
        // main sampler stays shared (behind a lock) only for PROSAC, whose
        // progressive schedule is global by construction.
        let mut sets = Vec::with_capacity(threads);
        for tid in 0..threads {
            let mut thread_state = self.state + 10 * tid as u64;
            let mut next_state = || {
                let s = thread_state;
                thread_state += 1;
                s
            };
            sets.push(WorkerSet {
                tid,
                estimator: self.estimator.clone_with_state(next_state()),
                degeneracy: self.degeneracy.clone_box(next_state()),
                quality: self.quality.clone_box(),
                verifier: self.verifier.clone_box(next_state()),
                local_optimization: self
                    .local_optimization
                    .as_ref()
                    .map(|lo| lo.clone_box(next_state())),
                termination: self.termination.clone_box(),
                sampler: (!is_prosac).then(|| self.sampler.clone_box(next_state())),
            });
        }
        let global_sampler = Mutex::new(&mut self.sampler);

        rayon::scope(|scope| {
            for mut set in sets {
                let success = &success;
                let counter = &num_hypothesis_tested;
                let best_slots = &best_slots;
                let global_sampler = &global_sampler;

                scope.spawn(move |_| {
                    if success.load(Ordering::Relaxed) {
                        return;
                    }
                    let tid = set.tid;
                    let mut sample = vec![0usize; set.estimator.sample_size()];
                    let mut models: Vec<Model> =
                        Vec::with_capacity(set.estimator.max_solutions());
                    let mut recovered = Model::zeros(3, 3);
                    let mut recovered_score = Score::worst();

                    let mut best_model_thread: Option<Model> = None;
                    let mut best_score_thread = Score::worst();
                    // Comparison baseline: tightened from peers at the sync
                    // points, but never adopts a peer's model.
                    let mut best_score_all_threads = Score::worst();

                    let mut max_iters = max_iterations;
                    let mut iters = 0usize;

                    while iters < max_iters && !success.load(Ordering::Relaxed) {
                        if counter.fetch_add(1, Ordering::Relaxed) > max_iters {
                            success.store(true, Ordering::Relaxed);
                            break;
                        }

                        if iters % 10 == 0 {
                            let mut best_thread_idx = tid;
                            let mut updated = false;
                            for (t, slot) in best_slots.iter().enumerate() {
                                let guard = slot.lock().expect("slot lock");
                                if guard.0.is_better(&best_score_all_threads) {
                                    best_score_all_threads = guard.0;
                                    best_thread_idx = t;
                                    updated = true;
                                }
                            }
                            if updated && best_thread_idx != tid {
                                set.quality.set_best_score(best_score_all_threads.cost);
                                set.verifier.update(best_score_all_threads.inlier_number);
                            }
                        }

                        match set.sampler.as_mut() {
                            Some(sampler) => sampler.generate_sample(&mut sample),
                            None => global_sampler
                                .lock()
                                .expect("sampler lock")
                                .generate_sample(&mut sample),
                        }

                        let n_models = set.estimator.estimate_models(&sample, &mut models);
                        for i in 0..n_models {
                            if !set.verifier.is_model_good(&mut *set.quality, &models[i]) {
                                continue;
                            }

                            let current_score = if is_magsac {
                                if best_model_thread.is_none() {
                                    best_model_thread = Some(models[i].clone());
                                }
                                let lo = set
                                    .local_optimization
                                    .as_mut()
                                    .expect("sigma mode carries a refiner");
                                lo.refine_with_candidate(
                                    best_model_thread.as_ref().expect("seeded above"),
                                    &best_score_thread,
                                    &models[i],
                                )
                            } else if let Some(score) = set.verifier.last_score() {
                                score
                            } else {
                                set.quality.score(&models[i])
                            };

                            if !current_score.is_better(&best_score_all_threads) {
                                continue;
                            }

                            let adopted = if set.degeneracy.recover_if_degenerate(
                                &sample,
                                &models[i],
                                &mut recovered,
                                &mut recovered_score,
                            ) {
                                if recovered_score.is_better(&best_score_thread) {
                                    best_score_thread = recovered_score;
                                    best_model_thread = Some(recovered.clone());
                                    true
                                } else {
                                    false
                                }
                            } else {
                                best_score_thread = current_score;
                                best_model_thread = Some(models[i].clone());
                                true
                            };
                            if !adopted {
                                continue;
                            }

                            *best_slots[tid].lock().expect("slot lock") = (
                                best_score_thread,
                                best_model_thread.clone(),
                            );
                            best_score_all_threads = best_score_thread;

                            max_iters = set.termination.update(
                                best_model_thread.as_ref().expect("just set"),
                                best_score_thread.inlier_number,
                            );
                            if counter.load(Ordering::Relaxed) > max_iters {
                                success.store(true, Ordering::Relaxed);
                                break;
                            }

                            if lo_enabled && !is_magsac {
                                let lo = set
                                    .local_optimization
                                    .as_mut()
                                    .expect("checked above");
                                let refined = lo.refine(
                                    best_model_thread.as_ref().expect("just set"),
                                    &best_score_thread,
                                );
                                if let Some((lo_model, lo_score)) = refined {
                                    if lo_score.is_better(&best_score_thread) {
                                        best_score_thread = lo_score;
                                        best_model_thread = Some(lo_model);
                                        *best_slots[tid].lock().expect("slot lock") = (
                                            best_score_thread,
                                            best_model_thread.clone(),
                                        );
                                        best_score_all_threads = best_score_thread;

                                        max_iters = set.termination.update(
                                            best_model_thread.as_ref().expect("just set"),
                                            best_score_thread.inlier_number,
                                        );
                                        if counter.load(Ordering::Relaxed) > max_iters {
                                            success.store(true, Ordering::Relaxed);
                                            break;
                                        }
                                    }
                                }
                            }
                        }

                        iters += 1;
                    }
                });
            }
        });

        // The winning model lives in the slot of whichever worker holds the
        // globally best score.
        let mut best_score = Score::worst();
        let mut best_model = None;
        for slot in &best_slots {
            let guard = slot.lock().expect("slot lock");
            if guard.0.is_better(&best_score) {
                best_score = guard.0;
                best_model = guard.1.clone();
            }
        }
        (best_model, best_score, num_hypothesis_tested.load(Ordering::Relaxed))
    }
}
