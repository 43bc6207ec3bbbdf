//! Batch battle runner for outcome statistics.
//!
//! Plays one scenario under many consecutive seeds in parallel using rayon
//! and aggregates who won each battle and what it cost.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

use battle_core::battle::WhoWon;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runner::{run_scenario, RunReport};
use crate::scenario::Scenario;

/// Aborted phases spelled out in [`BatchResults::digest`].
const MAX_LISTED_FAILURES: usize = 10;

/// Seeds, parallelism and output location of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Scenario file or built-in name.
    pub scenario: String,
    /// Battle phases to play, one per seed.
    pub phases: u32,
    /// Worker threads (0 = rayon default).
    pub threads: usize,
    /// Directory the results file is written to.
    pub output_dir: PathBuf,
    /// Seed of the first phase; later phases count up from it.
    pub seed_start: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            scenario: "skirmish".to_string(),
            phases: 100,
            threads: 0,
            output_dir: PathBuf::from("results"),
            seed_start: 0,
        }
    }
}

impl BatchConfig {
    /// Play `phases` seeds of `scenario`.
    pub fn new(scenario: &str, phases: u32) -> Self {
        Self {
            scenario: scenario.to_string(),
            phases,
            ..Default::default()
        }
    }

    /// Write results under `dir`.
    pub fn with_output(mut self, dir: PathBuf) -> Self {
        self.output_dir = dir;
        self
    }

    /// Start counting seeds at `seed`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed_start = seed;
        self
    }
}

/// Aggregates for the battles at one territory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteSummary {
    /// Territory name.
    pub site: String,
    /// Attacker wins.
    pub attacker_wins: u32,
    /// Defender wins.
    pub defender_wins: u32,
    /// Draws.
    pub draws: u32,
    /// Mean unit value the attacker lost.
    pub mean_attacker_lost_tuv: f64,
    /// Mean unit value the defender lost.
    pub mean_defender_lost_tuv: f64,
}

impl SiteSummary {
    /// Share of battles the attacker won.
    pub fn attacker_win_rate(&self) -> f64 {
        let total = self.attacker_wins + self.defender_wins + self.draws;
        f64::from(self.attacker_wins) / f64::from(total.max(1))
    }
}

/// Aggregates over every phase of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Phases that ran to a report.
    pub phases: usize,
    /// Battle records across those phases.
    pub battles: usize,
    /// Per-site aggregates, keyed by territory name.
    pub sites: BTreeMap<String, SiteSummary>,
}

impl BatchSummary {
    /// Aggregate finished phases.
    pub fn from_reports(reports: &[RunReport], names: &BTreeMap<u32, String>) -> Self {
        let mut sites: BTreeMap<String, SiteSummary> = BTreeMap::new();
        let mut lost: BTreeMap<String, (u64, u64, u32)> = BTreeMap::new();
        let mut battles = 0;
        for record in reports.iter().flat_map(|r| &r.records) {
            battles += 1;
            let name = names
                .get(&record.site.0)
                .cloned()
                .unwrap_or_else(|| record.site.to_string());
            let entry = sites.entry(name.clone()).or_insert_with(|| SiteSummary {
                site: name.clone(),
                ..SiteSummary::default()
            });
            match record.who_won {
                WhoWon::Attacker => entry.attacker_wins += 1,
                WhoWon::Defender => entry.defender_wins += 1,
                WhoWon::Draw | WhoWon::NotFinished => entry.draws += 1,
            }
            let tally = lost.entry(name).or_default();
            tally.0 += u64::from(record.attacker_lost_tuv);
            tally.1 += u64::from(record.defender_lost_tuv);
            tally.2 += 1;
        }
        for (name, (attacker, defender, count)) in lost {
            if let Some(site) = sites.get_mut(&name) {
                let n = f64::from(count.max(1));
                site.mean_attacker_lost_tuv = attacker as f64 / n;
                site.mean_defender_lost_tuv = defender as f64 / n;
            }
        }
        Self {
            phases: reports.len(),
            battles,
            sites,
        }
    }
}

/// Everything a batch produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResults {
    /// Configuration used.
    pub config: BatchConfig,
    /// One report per phase that ran.
    pub runs: Vec<RunReport>,
    /// Aggregates over `runs`.
    pub summary: BatchSummary,
    /// Wall-clock time of the batch.
    pub duration_seconds: f64,
    /// Phases that aborted.
    pub failures: Vec<RunFailure>,
}

impl BatchResults {
    /// Write the results as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Human-readable digest: phase counts, per-site odds and the first
    /// few aborted phases.
    pub fn digest(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} battle phases of '{}' ({} battles) in {:.1}s",
            self.summary.phases, self.config.scenario, self.summary.battles, self.duration_seconds
        );
        for (site, s) in &self.summary.sites {
            let _ = writeln!(
                out,
                "  {site}: attacker takes {:.1}% of {} battles, losing {:.1} TUV to {:.1}",
                s.attacker_win_rate() * 100.0,
                s.attacker_wins + s.defender_wins + s.draws,
                s.mean_attacker_lost_tuv,
                s.mean_defender_lost_tuv
            );
        }
        if !self.failures.is_empty() {
            let _ = writeln!(out, "{} phases aborted:", self.failures.len());
            for failure in self.failures.iter().take(MAX_LISTED_FAILURES) {
                let _ = writeln!(out, "  phase {} (seed {}): {}", failure.run, failure.seed, failure.message);
            }
            if self.failures.len() > MAX_LISTED_FAILURES {
                let _ = writeln!(out, "  {} more not listed", self.failures.len() - MAX_LISTED_FAILURES);
            }
        }
        out
    }

    /// Read results written by [`BatchResults::save`].
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(std::io::Error::other)
    }
}

/// A phase that aborted with a fatal battle error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    /// Position of the phase in the batch.
    pub run: u32,
    /// Dice seed of the phase.
    pub seed: u64,
    /// Error text.
    pub message: String,
}

/// Play `config.phases` seeds of one scenario in parallel.
pub fn run_batch(config: BatchConfig) -> BatchResults {
    let start = Instant::now();

    let scenario = match Scenario::resolve(&config.scenario) {
        Ok(s) => s,
        Err(e) => {
            warn!(scenario = %config.scenario, error = %e, "scenario failed to load");
            let failures = vec![RunFailure {
                run: 0,
                seed: config.seed_start,
                message: e.to_string(),
            }];
            return BatchResults {
                config,
                runs: Vec::new(),
                summary: BatchSummary::default(),
                duration_seconds: start.elapsed().as_secs_f64(),
                failures,
            };
        }
    };
    let names: BTreeMap<u32, String> = scenario.territories.iter().map(|t| (t.id, t.name.clone())).collect();

    info!(
        scenario = %config.scenario,
        phases = config.phases,
        first_seed = config.seed_start,
        "battle batch started"
    );

    if config.threads > 0 {
        // A global pool set earlier in the process wins.
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build_global()
            .ok();
    }

    let outcomes: Vec<Result<RunReport, RunFailure>> = (0..config.phases)
        .into_par_iter()
        .map(|run| {
            let seed = config.seed_start.wrapping_add(u64::from(run));
            run_scenario(&scenario, seed).map_err(|e| {
                warn!(run, seed, error = %e, "battle phase aborted");
                RunFailure {
                    run,
                    seed,
                    message: e.to_string(),
                }
            })
        })
        .collect();

    let (runs, failures): (Vec<_>, Vec<_>) = outcomes.into_iter().partition(Result::is_ok);
    let runs: Vec<RunReport> = runs.into_iter().filter_map(Result::ok).collect();
    let failures: Vec<RunFailure> = failures.into_iter().filter_map(Result::err).collect();
    debug!(completed = runs.len(), failed = failures.len(), "batch collected");

    let summary = BatchSummary::from_reports(&runs, &names);
    let duration_seconds = start.elapsed().as_secs_f64();

    info!(
        phases = summary.phases,
        battles = summary.battles,
        failed = failures.len(),
        seconds = duration_seconds,
        "battle batch finished"
    );

    BatchResults {
        config,
        runs,
        summary,
        duration_seconds,
        failures,
    }
}

/// Play the same seed several times and compare final state hashes.
pub fn verify_determinism(scenario: &Scenario, seed: u64, runs: u32) -> bool {
    let hashes: Vec<Option<u64>> = (0..runs)
        .map(|_| run_scenario(scenario, seed).ok().map(|r| r.state_hash))
        .collect();
    hashes.first().is_some_and(Option::is_some) && hashes.windows(2).all(|w| w[0] == w[1])
}

#[cfg(test)]
mod tests {
    use battle_core::battle::{BattleResultDescription, BattleType};
    use battle_core::ids::{BattleId, PlayerId, TerritoryId};
    use battle_core::records::BattleRecord;

    use super::*;
    use crate::runner::RunStatus;

    #[test]
    fn test_batch_config_default() {
        let config = BatchConfig::default();
        assert_eq!(config.phases, 100);
        assert_eq!(config.scenario, "skirmish");
    }

    #[test]
    fn test_batch_config_builder() {
        let config = BatchConfig::new("custom_scenario", 500)
            .with_output(PathBuf::from("/tmp/results"))
            .with_seed(12345);

        assert_eq!(config.scenario, "custom_scenario");
        assert_eq!(config.phases, 500);
        assert_eq!(config.seed_start, 12345);
    }

    #[test]
    fn test_run_batch_small() {
        let results = run_batch(BatchConfig::new("skirmish", 8));

        assert_eq!(results.runs.len(), 8);
        assert!(results.failures.is_empty());
        assert_eq!(results.summary.phases, 8);
        let frontier = &results.summary.sites["Frontier"];
        assert_eq!(frontier.attacker_wins + frontier.defender_wins + frontier.draws, 8);
        assert!(results.summary.sites.contains_key("Channel"));
    }

    #[test]
    fn test_unknown_scenario_reported() {
        let results = run_batch(BatchConfig::new("no_such_scenario", 3));
        assert!(results.runs.is_empty());
        assert_eq!(results.failures.len(), 1);
        assert!(results.digest().contains("1 phases aborted"));
    }

    #[test]
    fn test_digest_lists_sites_and_caps_failures() {
        let failures = (0..12)
            .map(|run| RunFailure {
                run,
                seed: u64::from(run),
                message: "dice stream exhausted".to_string(),
            })
            .collect();
        let results = BatchResults {
            config: BatchConfig::new("skirmish", 13),
            runs: vec![create_test_report(0, &[(4, WhoWon::Attacker)])],
            summary: BatchSummary::from_reports(
                &[create_test_report(0, &[(4, WhoWon::Attacker)])],
                &BTreeMap::from([(4, "Frontier".to_string())]),
            ),
            duration_seconds: 1.0,
            failures,
        };

        let digest = results.digest();

        assert!(digest.starts_with("1 battle phases of 'skirmish' (1 battles)"));
        assert!(digest.contains("Frontier: attacker takes 100.0% of 1 battles"));
        assert!(digest.contains("phase 9 (seed 9)"));
        assert!(!digest.contains("phase 10 (seed 10)"));
        assert!(digest.contains("2 more not listed"));
    }

    fn create_test_report(seed: u64, sites: &[(u32, WhoWon)]) -> RunReport {
        let records = sites
            .iter()
            .enumerate()
            .map(|(i, &(site, who_won))| BattleRecord {
                battle: BattleId(i as u64),
                site: TerritoryId(site),
                attacker: PlayerId(0),
                defender: PlayerId(1),
                battle_type: BattleType::Normal,
                attacker_lost_tuv: 6,
                defender_lost_tuv: 3,
                who_won,
                result: Some(BattleResultDescription::Conquered),
            })
            .collect();
        RunReport {
            scenario: "test".to_string(),
            seed,
            status: RunStatus::Completed,
            battles_fought: 0,
            dice_rolls: 0,
            records,
            state_hash: 0,
        }
    }

    #[test]
    fn test_summary_counts_phases_and_battles() {
        let names = BTreeMap::from([(4, "Frontier".to_string())]);
        let reports = vec![
            create_test_report(1, &[(4, WhoWon::Attacker), (9, WhoWon::Draw)]),
            create_test_report(2, &[(4, WhoWon::Defender)]),
            create_test_report(3, &[]),
        ];

        let summary = BatchSummary::from_reports(&reports, &names);

        assert_eq!(summary.phases, 3);
        assert_eq!(summary.battles, 3);
        let frontier = &summary.sites["Frontier"];
        assert_eq!((frontier.attacker_wins, frontier.defender_wins), (1, 1));
        assert!((frontier.attacker_win_rate() - 0.5).abs() < f64::EPSILON);
        assert!((frontier.mean_attacker_lost_tuv - 6.0).abs() < f64::EPSILON);
        assert_eq!(summary.sites["t9"].draws, 1);
    }

    #[test]
    fn test_empty_summary() {
        let summary = BatchSummary::from_reports(&[], &BTreeMap::new());
        assert_eq!(summary, BatchSummary::default());
    }

    #[test]
    fn test_verify_determinism() {
        let scenario = Scenario::builtin("skirmish").unwrap();
        assert!(verify_determinism(&scenario, 12345, 3));
    }

    #[test]
    fn test_batch_results_save_load() {
        let results = run_batch(BatchConfig::new("skirmish", 4));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");

        results.save(&path).unwrap();
        assert!(path.exists());

        let loaded = BatchResults::load(&path).unwrap();
        assert_eq!(loaded.runs.len(), 4);
        assert_eq!(loaded.summary, results.summary);
        assert_eq!(loaded.config.scenario, "skirmish");
    }
}
