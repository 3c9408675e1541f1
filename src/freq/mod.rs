//! Allele frequencies from dbSNP, kept in an on-disk cache.

pub mod cache;
pub mod dbsnp;

use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use clap::Parser;

use crate::common::Assembly;
use crate::gwas;
use crate::variant::{self, Normalizer, VariantKey};

use self::cache::{AlleleFrequencies, Cache, Entry};
use self::dbsnp::{FrequencySource, LookupError};

/// NCBI E-utilities efetch endpoint.
pub const DEFAULT_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

/// dbSNP study used for population allele frequencies.
pub const DEFAULT_STUDY: &str = "dbGaP_PopFreq";

/// Which observation to use when dbSNP reports placements on several builds.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    clap::ValueEnum,
    serde::Deserialize,
    serde::Serialize,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BuildPolicy {
    /// The first observation of the study, whatever its build.
    #[default]
    FirstReported,
    /// Only observations placed on the configured assembly.
    MatchAssembly,
}

/// Configuration of frequency retrieval.
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the efetch endpoint.
    pub url: String,
    /// dbSNP study to take frequencies from.
    pub study: String,
    /// Number of rsIDs per request.
    pub batch_size: usize,
    /// Pause between two requests.
    pub sleep: Duration,
    /// Timeout of one request.
    pub timeout: Duration,
    /// Observation selection on build mismatch.
    pub build_policy: BuildPolicy,
    /// Assembly for `BuildPolicy::MatchAssembly`.
    pub assembly: Assembly,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            study: DEFAULT_STUDY.to_string(),
            batch_size: 15,
            sleep: Duration::from_secs(3),
            timeout: Duration::from_secs(30),
            build_policy: BuildPolicy::default(),
            assembly: Assembly::default(),
        }
    }
}

/// Command line arguments for the frequency cache and its source.
#[derive(Parser, Debug, Clone)]
pub struct SourceArgs {
    /// Path to the allele frequency cache file.
    #[clap(long)]
    pub path_cache: PathBuf,
    /// URL of the dbSNP efetch endpoint.
    #[clap(long, default_value = DEFAULT_URL)]
    pub dbsnp_url: String,
    /// dbSNP study to take allele frequencies from.
    #[clap(long, default_value = DEFAULT_STUDY)]
    pub frequency_study: String,
    /// Number of rsIDs per dbSNP request.
    #[clap(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    pub batch_size: u64,
    /// Milliseconds to wait between dbSNP requests.
    #[clap(long, default_value_t = 3000)]
    pub sleep_ms: u64,
    /// Timeout of one dbSNP request in seconds.
    #[clap(long, default_value_t = 30)]
    pub timeout_secs: u64,
    /// Observation to use when dbSNP reports several builds.
    #[clap(long, value_enum, default_value_t = BuildPolicy::FirstReported)]
    pub build_policy: BuildPolicy,
}

impl SourceArgs {
    /// The retrieval configuration for `assembly`.
    pub fn config(&self, assembly: Assembly) -> Config {
        Config {
            url: self.dbsnp_url.clone(),
            study: self.frequency_study.clone(),
            batch_size: usize::try_from(self.batch_size).unwrap_or(usize::MAX),
            sleep: Duration::from_millis(self.sleep_ms),
            timeout: Duration::from_secs(self.timeout_secs),
            build_policy: self.build_policy,
            assembly,
        }
    }
}

/// Resolves allele frequencies of variants.
pub trait FrequencyLookup {
    /// The frequencies of `key`, or `None` if there are none.
    fn frequency_for(
        &mut self,
        key: &VariantKey,
    ) -> Result<Option<&AlleleFrequencies>, anyhow::Error>;
}

/// A cache alone answers from what it has, without external calls.
impl FrequencyLookup for Cache {
    fn frequency_for(
        &mut self,
        key: &VariantKey,
    ) -> Result<Option<&AlleleFrequencies>, anyhow::Error> {
        Ok(self.get(key).and_then(Entry::found))
    }
}

/// What happened during frequency retrieval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FetchStats {
    /// Distinct keys answered from the cache.
    pub cached: usize,
    /// Keys with frequencies from the source.
    pub found: usize,
    /// Keys the source has no frequencies for.
    pub not_found: usize,
    /// Positional keys, which cannot be queried.
    pub positional: usize,
    /// Keys given up on because their request failed.
    pub failed: usize,
    /// Requests sent to the source.
    pub requests: usize,
}

/// Cache in front of a frequency source.
///
/// Every key looked up ends up in the cache, as `NotFound` if the source
/// failed, so that it is never requested again.
#[derive(Debug)]
pub struct Lookup<S> {
    cache: Cache,
    source: S,
    config: Config,
    stats: FetchStats,
}

impl<S> Lookup<S>
where
    S: FrequencySource,
{
    /// Create a new `Lookup`.
    pub fn new(cache: Cache, source: S, config: Config) -> Self {
        Self {
            cache,
            source,
            config,
            stats: FetchStats::default(),
        }
    }

    /// Counts of what happened so far.
    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    /// The underlying cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Make sure all of `keys` are in the cache, fetching the missing ones in batches.
    ///
    /// # Errors
    ///
    /// Only if the cache cannot be written; lookup failures are recorded as `NotFound`.
    pub fn prefetch<'k, I>(&mut self, keys: I) -> Result<(), anyhow::Error>
    where
        I: IntoIterator<Item = &'k VariantKey>,
    {
        let mut missing = BTreeSet::new();
        for key in keys {
            if self.cache.contains(key) {
                self.stats.cached += 1;
            } else if let VariantKey::Rsid(rsid) = key {
                missing.insert(*rsid);
            } else if self.cache.insert(key.clone(), Entry::NotFound)? {
                self.stats.positional += 1;
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let missing = missing.into_iter().collect::<Vec<_>>();
        let batch_size = self.config.batch_size.max(1);
        let num_batches = missing.len().div_ceil(batch_size);
        tracing::info!(
            "fetching frequencies of {} variants in {} batches",
            missing.len(),
            num_batches
        );
        let progress = indicatif::ProgressBar::new(num_batches as u64);
        progress.set_style(
            indicatif::ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len:5} {msg}",
            )
            .map_err(|e| anyhow::anyhow!("problem with progress template: {}", e))?,
        );

        for (i, batch) in missing.chunks(batch_size).enumerate() {
            if i > 0 {
                self.pause();
            }
            self.fetch_batch(batch)?;
            progress.inc(1);
        }
        progress.finish_and_clear();
        tracing::info!("frequency retrieval done: {:?}", &self.stats);

        Ok(())
    }

    /// Fetch one batch; an undecodable batch is retried one rsID at a time.
    fn fetch_batch(&mut self, batch: &[u64]) -> Result<(), anyhow::Error> {
        self.stats.requests += 1;
        match self.source.fetch(batch) {
            Ok(found) => self.record(batch, found),
            Err(LookupError::Decode(e)) if batch.len() > 1 => {
                tracing::warn!("{}, retrying {} rsIDs one by one", e, batch.len());
                for rsid in batch {
                    self.pause();
                    self.fetch_batch(std::slice::from_ref(rsid))?;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("giving up on {} rsIDs: {}", batch.len(), e);
                self.stats.failed += batch.len();
                for rsid in batch {
                    self.cache.insert(VariantKey::Rsid(*rsid), Entry::NotFound)?;
                }
                Ok(())
            }
        }
    }

    fn record(
        &mut self,
        batch: &[u64],
        mut found: std::collections::BTreeMap<u64, AlleleFrequencies>,
    ) -> Result<(), anyhow::Error> {
        for rsid in batch {
            let entry = match found.remove(rsid) {
                Some(frequencies) => {
                    self.stats.found += 1;
                    Entry::Found(frequencies)
                }
                None => {
                    self.stats.not_found += 1;
                    Entry::NotFound
                }
            };
            self.cache.insert(VariantKey::Rsid(*rsid), entry)?;
        }
        Ok(())
    }

    fn pause(&self) {
        if !self.config.sleep.is_zero() {
            std::thread::sleep(self.config.sleep);
        }
    }
}

impl<S> FrequencyLookup for Lookup<S>
where
    S: FrequencySource,
{
    fn frequency_for(
        &mut self,
        key: &VariantKey,
    ) -> Result<Option<&AlleleFrequencies>, anyhow::Error> {
        if !self.cache.contains(key) {
            self.prefetch(std::iter::once(key))?;
        }
        Ok(self.cache.get(key).and_then(Entry::found))
    }
}

/// Command line arguments for `fetch` command.
#[derive(Parser, Debug)]
#[command(about = "Fill the allele frequency cache from dbSNP", long_about = None)]
pub struct Args {
    /// Variant normalization.
    #[command(flatten)]
    pub variant: variant::Args,
    /// Frequency cache and source.
    #[command(flatten)]
    pub source: SourceArgs,
    /// Directory with the clean per-trait files.
    #[clap(long)]
    pub path_clean_dir: PathBuf,
}

/// Main entry point for the `fetch` command.
///
/// # Errors
///
/// Returns an error if setup fails, the cache cannot be written, or any
/// clean file could not be read.
pub fn run(common_args: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("  running command `fetch`");
    tracing::info!("  common_args = {:?}", &common_args);
    tracing::info!("  args = {:?}", &args);

    let normalizer = Normalizer::from_args(&args.variant)?;
    let (associations, failed) = gwas::io::load_clean_dir(&args.path_clean_dir)?;
    let keys = variant_keys(
        &normalizer,
        associations.iter().map(|a| a.variant.as_str()),
    );

    let config = args.source.config(normalizer.assembly());
    let cache = Cache::open(&args.source.path_cache)?;
    let mut lookup = Lookup::new(cache, dbsnp::Client::new(&config)?, config);
    lookup.prefetch(&keys)?;
    tracing::info!(
        "cache {} now holds {} entries: {:?}",
        args.source.path_cache.display(),
        lookup.cache().len(),
        &lookup.stats()
    );

    if failed > 0 {
        anyhow::bail!("{} clean files could not be read", failed);
    }

    Ok(())
}

/// The distinct normalizable keys of `variants`; others are logged and skipped.
pub fn variant_keys<'a, I>(normalizer: &Normalizer, variants: I) -> BTreeSet<VariantKey>
where
    I: IntoIterator<Item = &'a str>,
{
    variants
        .into_iter()
        .filter_map(|variant| match normalizer.normalize(variant) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!("skipping variant: {}", e);
                None
            }
        })
        .collect()
}
