//! Cleaning of raw per-trait GWAS association files.

pub mod clean;
pub mod io;

use std::path::{Path, PathBuf};

use clap::Parser;
use serde_with::{formats::SemicolonSeparator, StringWithSeparator};

use crate::common::{deserialize_option_na, list_files, serialize_option_na};
use crate::variant::{self, Normalizer};

use self::clean::{CleanStats, Cleaner};

/// Problems with raw GWAS rows and files.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The row's variant identity could not be normalized.
    #[error("unparsable variant: {0}")]
    UnparsableVariant(#[from] variant::Error),
    /// The row has no parseable p-value.
    #[error("missing or unparsable p-value: {0:?}")]
    MissingPValue(String),
    /// The row's p-value is outside of `(0, 1]`.
    #[error("invalid significance value: {0}")]
    InvalidSignificance(f64),
    /// The file lacks a column required by its format.
    #[error("missing required column: {0}")]
    MissingRequiredColumn(String),
}

/// One cleaned association between a variant and a trait.
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Association {
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
    /// Genes mapped to the variant by the GWAS catalog.
    #[serde_as(as = "StringWithSeparator::<SemicolonSeparator, String>")]
    pub mapped_genes: Vec<String>,
}

/// Command line arguments for `clean` command.
#[derive(Parser, Debug)]
#[command(about = "Clean raw per-trait GWAS files", long_about = None)]
pub struct Args {
    /// Variant normalization.
    #[command(flatten)]
    pub variant: variant::Args,
    /// Directory with the raw per-trait GWAS files.
    #[clap(long)]
    pub path_raw_dir: PathBuf,
    /// Directory to write the clean per-trait files to.
    #[clap(long)]
    pub path_clean_dir: PathBuf,
    /// CSV file with `Trait` and `Child traits` columns.
    #[clap(long)]
    pub path_trait_metadata: Option<PathBuf>,
    /// Suffix of raw trait files; the file name before it is the trait.
    #[clap(long, default_value = "_gwas_catalog_2022.csv")]
    pub trait_file_suffix: String,
}

/// Main entry point for the `clean` command.
///
/// Every raw trait file is processed even if some fail.
///
/// # Arguments
///
/// * `common_args` - Commonly used command line arguments.
/// * `args` - Command line arguments specific to `clean` command.
///
/// # Errors
///
/// Returns an error if setup fails or if any trait file failed.
pub fn run(common_args: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("  running command `clean`");
    tracing::info!("  common_args = {:?}", &common_args);
    tracing::info!("  args = {:?}", &args);

    let normalizer = Normalizer::from_args(&args.variant)?;
    let metadata = args
        .path_trait_metadata
        .as_ref()
        .map(io::load_trait_metadata)
        .transpose()
        .map_err(|e| anyhow::anyhow!("problem loading trait metadata: {}", e))?;
    std::fs::create_dir_all(&args.path_clean_dir)
        .map_err(|e| anyhow::anyhow!("could not create clean directory: {}", e))?;

    let trait_files = list_files(&args.path_raw_dir)?
        .into_iter()
        .filter_map(|path| {
            io::trait_from_path(&path, &args.trait_file_suffix)
                .map(|main_trait| (path, main_trait))
        })
        .collect::<Vec<_>>();
    tracing::info!("found {} raw trait files", trait_files.len());

    let mut total = CleanStats::default();
    let mut failed = 0usize;
    for (path, main_trait) in &trait_files {
        let cleaner = Cleaner::new(&normalizer, main_trait, metadata.as_ref());
        match clean_file(&cleaner, path, &args.path_clean_dir) {
            Ok(stats) => total += stats,
            Err(e) => {
                tracing::error!("failed to clean {}: {}", path.display(), e);
                failed += 1;
            }
        }
    }

    tracing::info!("cleaned {} trait files: {:?}", trait_files.len() - failed, &total);
    if failed > 0 {
        anyhow::bail!("{} of {} trait files failed", failed, trait_files.len());
    }

    Ok(())
}

/// Clean one raw file and write the result to `clean_dir`.
fn clean_file(
    cleaner: &Cleaner,
    path: &Path,
    clean_dir: &Path,
) -> Result<CleanStats, anyhow::Error> {
    tracing::info!("cleaning {} for trait {:?}", path.display(), cleaner.main_trait());
    let (associations, stats) = cleaner.clean_file(path)?;
    let output_path = clean_dir.join(io::clean_file_name(cleaner.main_trait()));
    io::write_clean_file(&output_path, &associations)?;
    tracing::info!("wrote {} ({:?})", output_path.display(), &stats);

    Ok(stats)
}

#[cfg(test)]
mod test {
    use crate::common::Assembly;

    #[tracing_test::traced_test]
    #[test]
    fn run_smoke() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let common = crate::common::Args {
            verbose: clap_verbosity_flag::Verbosity::new(1, 0),
        };
        let args = super::Args {
            variant: crate::variant::Args {
                assembly: Assembly::Grch38,
                path_lookup_table: Some("tests/data/variant/lookup_table.txt".into()),
            },
            path_raw_dir: "tests/data/gwas/raw".into(),
            path_clean_dir: tmp_dir.path().to_path_buf(),
            path_trait_metadata: Some("tests/data/gwas/gwas_trait_metadata.csv".into()),
            trait_file_suffix: "_gwas_catalog_2022.csv".into(),
        };

        super::run(&common, &args)?;

        let clean = super::io::load_clean_file(tmp_dir.path().join("schizophrenia.tsv"))?;
        assert_eq!(clean.len(), 4);
        let clean = super::io::load_clean_file(tmp_dir.path().join("bipolar_disorder.tsv"))?;
        assert_eq!(clean.len(), 2);

        Ok(())
    }

    #[tracing_test::traced_test]
    #[test]
    fn run_isolates_failed_files() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let common = crate::common::Args {
            verbose: clap_verbosity_flag::Verbosity::new(1, 0),
        };
        let args = super::Args {
            variant: crate::variant::Args {
                assembly: Assembly::Grch38,
                path_lookup_table: None,
            },
            path_raw_dir: "tests/data/gwas/raw".into(),
            path_clean_dir: tmp_dir.path().to_path_buf(),
            path_trait_metadata: None,
            trait_file_suffix: ".csv".into(),
        };

        // `broken_format.csv` has no usable columns, the others still get written.
        assert!(super::run(&common, &args).is_err());
        assert!(tmp_dir
            .path()
            .join("schizophrenia_gwas_catalog_2022.tsv")
            .exists());
        assert!(!tmp_dir.path().join("broken_format.tsv").exists());

        Ok(())
    }
}
