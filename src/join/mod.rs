//! Joining of clean GWAS associations with allele frequencies and tissue
//! associations.
//!
//! The join is a left outer join on the canonical variant key: every
//! association yields one record, with absent frequency and empty tissue set
//! where the auxiliary data has nothing.  Only associations whose variant
//! cannot be normalized are dropped.

use std::{
    collections::BTreeSet,
    io::BufWriter,
    path::{Path, PathBuf},
};

use clap::Parser;
use serde_with::{formats::SemicolonSeparator, StringWithSeparator};

use crate::common::{deserialize_option_na, serialize_option_na};
use crate::freq::{self, cache::Cache, dbsnp, FrequencyLookup, Lookup};
use crate::gwas::{self, Association};
use crate::tissue::{self, TissueGene};
use crate::variant::{self, Normalizer};

/// One row of the joined output.
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct JoinedRecord {
    /// Canonical variant key.
    pub variant: String,
    /// Normalized trait name.
    #[serde(rename = "trait")]
    pub trait_name: String,
    /// The p-value, in `(0, 1]`.
    pub p_value: f64,
    /// Odds ratio or beta, if reported.
    #[serde(
        serialize_with = "serialize_option_na",
        deserialize_with = "deserialize_option_na"
    )]
    pub effect_size: Option<f64>,
    /// Risk allele, if known.
    #[serde(
        serialize_with = "serialize_option_na",
        deserialize_with = "deserialize_option_na"
    )]
    pub risk_allele: Option<String>,
    /// Frequency of the risk allele.
    #[serde(
        serialize_with = "serialize_option_na",
        deserialize_with = "deserialize_option_na"
    )]
    pub frequency: Option<f64>,
    /// Genes mapped to the variant by the GWAS catalog.
    #[serde_as(as = "StringWithSeparator::<SemicolonSeparator, String>")]
    pub mapped_genes: Vec<String>,
    /// Tissues (and genes) the variant is significant in.
    #[serde_as(as = "StringWithSeparator::<SemicolonSeparator, TissueGene>")]
    pub tissues: BTreeSet<TissueGene>,
}

/// Counts of what happened during a join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JoinStats {
    /// Associations read.
    pub records_in: usize,
    /// Joined records emitted.
    pub records_out: usize,
    /// Associations dropped because their variant could not be normalized.
    pub unparsable_variant: usize,
    /// Records with a risk allele frequency.
    pub with_frequency: usize,
    /// Records with at least one tissue association.
    pub with_tissues: usize,
}

/// Join `associations` with allele frequencies and tissue associations.
///
/// The output keeps the order of `associations`.
///
/// # Errors
///
/// Only if the frequency lookup fails to persist its cache.
pub fn join<'a, I, L>(
    associations: I,
    normalizer: &Normalizer,
    frequencies: &mut L,
    tissues: &tissue::Index,
) -> Result<(Vec<JoinedRecord>, JoinStats), anyhow::Error>
where
    I: IntoIterator<Item = &'a Association>,
    L: FrequencyLookup + ?Sized,
{
    let mut stats = JoinStats::default();
    let mut result = Vec::new();

    for association in associations {
        stats.records_in += 1;
        let key = match normalizer.normalize(&association.variant) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(
                    "dropping association with {:?}: {}",
                    &association.trait_name,
                    e
                );
                stats.unparsable_variant += 1;
                continue;
            }
        };

        let frequency = match association.risk_allele.as_deref() {
            Some(allele) => frequencies
                .frequency_for(&key)?
                .and_then(|frequencies| frequencies.for_allele(allele)),
            None => None,
        };
        let tissues = tissues.get(&key).cloned().unwrap_or_default();

        stats.records_out += 1;
        if frequency.is_some() {
            stats.with_frequency += 1;
        }
        if !tissues.is_empty() {
            stats.with_tissues += 1;
        }
        result.push(JoinedRecord {
            variant: key.to_string(),
            trait_name: association.trait_name.clone(),
            p_value: association.p_value,
            effect_size: association.effect_size,
            risk_allele: association.risk_allele.clone(),
            frequency,
            mapped_genes: association.mapped_genes.clone(),
            tissues,
        });
    }

    Ok((result, stats))
}

/// Write joined records as TSV.
///
/// # Errors
///
/// If anything goes wrong, it returns a generic `anyhow::Error`.
pub fn write_output<P>(path: P, records: &[JoinedRecord]) -> Result<(), anyhow::Error>
where
    P: AsRef<Path>,
{
    let file = std::fs::File::create(path.as_ref())
        .map_err(|e| anyhow::anyhow!("problem creating {}: {}", path.as_ref().display(), e))?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(BufWriter::new(file));
    for record in records {
        writer
            .serialize(record)
            .map_err(|e| anyhow::anyhow!("problem writing record: {}", e))?;
    }
    writer
        .flush()
        .map_err(|e| anyhow::anyhow!("problem flushing {}: {}", path.as_ref().display(), e))?;

    Ok(())
}

/// Command line arguments for `join` command.
#[derive(Parser, Debug)]
#[command(about = "Join clean GWAS files with frequencies and tissues", long_about = None)]
pub struct Args {
    /// Variant normalization.
    #[command(flatten)]
    pub variant: variant::Args,
    /// Frequency cache and source.
    #[command(flatten)]
    pub source: freq::SourceArgs,
    /// Directory with the clean per-trait files.
    #[clap(long)]
    pub path_clean_dir: PathBuf,
    /// Directory with one significant variant file per tissue.
    #[clap(long)]
    pub path_tissue_dir: PathBuf,
    /// Path to the joined output TSV.
    #[clap(long)]
    pub path_output: PathBuf,
    /// Only use the frequency cache, never query dbSNP.
    #[clap(long, default_value_t = false)]
    pub offline: bool,
}

/// Main entry point for the `join` command.
///
/// # Errors
///
/// Returns an error if setup fails, the output cannot be written, or any
/// clean or tissue file could not be read.
pub fn run(common_args: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("  running command `join`");
    tracing::info!("  common_args = {:?}", &common_args);
    tracing::info!("  args = {:?}", &args);

    let normalizer = Normalizer::from_args(&args.variant)?;
    let (associations, failed_clean) = gwas::io::load_clean_dir(&args.path_clean_dir)?;
    let (tissues, _, failed_tissue) = tissue::Index::load_dir(&args.path_tissue_dir, &normalizer)?;

    let (records, stats) = if args.offline {
        let mut cache = Cache::load(&args.source.path_cache)?;
        join(&associations, &normalizer, &mut cache, &tissues)?
    } else {
        let config = args.source.config(normalizer.assembly());
        let cache = Cache::open(&args.source.path_cache)?;
        let mut lookup = Lookup::new(cache, dbsnp::Client::new(&config)?, config);
        let keys = freq::variant_keys(
            &normalizer,
            associations.iter().map(|a| a.variant.as_str()),
        );
        lookup.prefetch(&keys)?;
        join(&associations, &normalizer, &mut lookup, &tissues)?
    };

    write_output(&args.path_output, &records)?;
    tracing::info!("wrote {}: {:?}", args.path_output.display(), &stats);

    if failed_clean + failed_tissue > 0 {
        anyhow::bail!(
            "{} clean files and {} tissue files could not be read",
            failed_clean,
            failed_tissue
        );
    }

    Ok(())
}
