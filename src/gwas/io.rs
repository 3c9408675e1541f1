//! I/O code for raw and clean GWAS association files.
//!
//! Raw files come in different shapes depending on where they were exported
//! from.  The shape is detected once from the header line (see [`Format`])
//! and then rows are extracted into [`RawAssociation`] values.

use std::{
    collections::BTreeSet,
    io::{BufRead as _, BufWriter},
    path::Path,
};

use super::{Association, Error};
use crate::common::{list_files, open_read};

/// Cell value used by the GWAS catalog for "no value".
const NOT_REPORTED: [&str; 4] = ["", "-", "NR", "NA"];

/// Raw file formats, distinguished by their header signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Format {
    /// GWAS catalog association export (`Variant and risk allele`, `P-value`, ...).
    CatalogExport,
    /// GWAS catalog summary statistics (`variant_id`, `p_value`, ...).
    SummaryStatistics,
}

/// Column indices resolved from a header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Columns {
    /// Variant token (possibly with embedded risk allele).
    pub variant: Option<usize>,
    /// Chromosome, used with `position` when there is no variant token.
    pub chromosome: Option<usize>,
    /// Base pair position.
    pub position: Option<usize>,
    /// Location as `chrom:pos`, the fallback for unparsable variant tokens.
    pub location: Option<usize>,
    /// P-value.
    pub p_value: usize,
    /// Odds ratio or beta; the first reported value wins.
    pub effect: Vec<usize>,
    /// Risk / effect allele.
    pub risk_allele: Option<usize>,
    /// Trait name.
    pub trait_name: Option<usize>,
    /// Mapped genes.
    pub mapped_genes: Option<usize>,
}

/// Find the first of `names` in `header`, ignoring case and whitespace.
fn find_column(header: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    find_columns(header, names).into_iter().next()
}

/// Find all of `names` in `header`, in the order of `names`.
fn find_columns(header: &csv::StringRecord, names: &[&str]) -> Vec<usize> {
    names
        .iter()
        .filter_map(|name| {
            header
                .iter()
                .position(|column| column.trim().eq_ignore_ascii_case(name))
        })
        .collect()
}

impl Format {
    /// Detect the format of a raw file from its header.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingRequiredColumn` if the header matches no format
    /// or lacks a column the matched format requires.
    pub fn detect(header: &csv::StringRecord) -> Result<(Format, Columns), Error> {
        let missing = |name: &str| Error::MissingRequiredColumn(name.to_string());

        if let Some(variant) = find_column(header, &["Variant and risk allele"]) {
            let columns = Columns {
                variant: Some(variant),
                location: find_column(header, &["Location"]),
                p_value: find_column(header, &["P-value"]).ok_or_else(|| missing("P-value"))?,
                effect: find_columns(header, &["OR or BETA", "OR", "Odds ratio", "Beta"]),
                trait_name: find_column(header, &["Trait(s)", "Reported trait"]),
                mapped_genes: find_column(header, &["Mapped gene", "Mapped genes"]),
                ..Default::default()
            };
            Ok((Format::CatalogExport, columns))
        } else if let Some(p_value) = find_column(header, &["p_value", "pval"]) {
            let columns = Columns {
                variant: find_column(header, &["hm_rsid", "rsid", "variant_id", "hm_variant_id"]),
                chromosome: find_column(header, &["chromosome", "hm_chrom"]),
                position: find_column(header, &["base_pair_location", "hm_pos"]),
                p_value,
                effect: find_columns(header, &["odds_ratio", "hm_odds_ratio", "beta", "hm_beta"]),
                risk_allele: find_column(header, &["effect_allele", "hm_effect_allele"]),
                trait_name: find_column(header, &["trait"]),
                ..Default::default()
            };
            if columns.variant.is_none()
                && (columns.chromosome.is_none() || columns.position.is_none())
            {
                return Err(missing("variant_id"));
            }
            Ok((Format::SummaryStatistics, columns))
        } else {
            Err(missing("Variant and risk allele or p_value"))
        }
    }
}

/// One row of a raw file, split into its relevant cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawAssociation {
    /// Variant token without risk allele.
    pub variant: Option<String>,
    /// Location fallback, `chrom:pos`.
    pub location: Option<String>,
    /// P-value as written.
    pub p_value: Option<String>,
    /// Effect size as written.
    pub effect: Option<String>,
    /// Risk allele, `None` if unknown.
    pub risk_allele: Option<String>,
    /// Trait name as written.
    pub trait_name: Option<String>,
    /// Mapped genes, split.
    pub mapped_genes: Vec<String>,
}

impl RawAssociation {
    /// Extract the relevant cells from `record`.
    pub fn from_record(record: &csv::StringRecord, format: Format, columns: &Columns) -> Self {
        let cell = |idx: Option<usize>| {
            idx.and_then(|idx| record.get(idx))
                .map(str::trim)
                .filter(|value| !NOT_REPORTED.contains(value))
                .map(str::to_string)
        };

        let (variant, risk_allele) = match format {
            Format::CatalogExport => match cell(columns.variant) {
                Some(value) => {
                    let (variant, allele) = split_risk_allele(&value);
                    (Some(variant.to_string()), allele.map(str::to_string))
                }
                None => (None, None),
            },
            Format::SummaryStatistics => {
                let variant = cell(columns.variant).or_else(|| {
                    cell(columns.chromosome)
                        .zip(cell(columns.position))
                        .map(|(chrom, pos)| format!("{}:{}", chrom, pos))
                });
                (variant, cell(columns.risk_allele))
            }
        };

        Self {
            variant,
            location: cell(columns.location),
            p_value: cell(Some(columns.p_value)),
            effect: columns.effect.iter().find_map(|idx| cell(Some(*idx))),
            risk_allele: risk_allele
                .map(|allele| allele.trim().to_ascii_uppercase())
                .filter(|allele| !allele.is_empty() && allele != "?"),
            trait_name: cell(columns.trait_name),
            mapped_genes: cell(columns.mapped_genes)
                .map(|genes| split_mapped_genes(&genes))
                .unwrap_or_default(),
        }
    }
}

/// Split `rs1001780-<b>G</b>` into `("rs1001780", Some("G"))`.
pub fn split_risk_allele(value: &str) -> (&str, Option<&str>) {
    match value.split_once('-') {
        Some((variant, rest)) => {
            let allele = rest
                .trim()
                .strip_prefix("<b>")
                .and_then(|rest| rest.strip_suffix("</b>"))
                .unwrap_or(rest)
                .trim();
            (variant.trim(), Some(allele).filter(|a| !a.is_empty()))
        }
        None => (value.trim(), None),
    }
}

/// Split the `Mapped gene` cell, dropping unknown markers.
fn split_mapped_genes(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|gene| !gene.is_empty() && *gene != "-" && *gene != "'-")
        .map(str::to_string)
        .collect()
}

/// Trim and lower-case a trait name.
pub fn normalize_trait_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Derive the main trait from a raw file name, if it ends with `suffix`.
///
/// `schizophrenia_gwas_catalog_2022.csv` with suffix `_gwas_catalog_2022.csv`
/// yields `schizophrenia`.
pub fn trait_from_path(path: &Path, suffix: &str) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(suffix))
        .filter(|name| !name.is_empty())
        .map(|name| normalize_trait_name(&name.replace('_', " ")))
}

/// File name of the clean file for a trait.
pub fn clean_file_name(main_trait: &str) -> String {
    format!("{}.tsv", main_trait.replace(' ', "_"))
}

/// Load raw GWAS file.
///
/// # Arguments
///
/// * `path` - Path to the raw file; comma- or tab-separated, optionally gzipped.
///
/// # Returns
///
/// The detected format and the raw rows.
///
/// # Errors
///
/// Returns `Error::MissingRequiredColumn` (wrapped in `anyhow::Error`) when the
/// file is structurally unusable, and a generic `anyhow::Error` on I/O problems.
pub fn load_raw_file<P>(path: P) -> Result<(Format, Vec<RawAssociation>), anyhow::Error>
where
    P: AsRef<Path>,
{
    tracing::debug!("opening file: {:?}", path.as_ref());
    let mut reader = open_read(path)?;

    // Sniff delimiter from the header line.
    let delimiter = {
        let buf = reader
            .fill_buf()
            .map_err(|e| anyhow::anyhow!("problem reading header: {}", e))?;
        let header_line = buf.split(|b| *b == b'\n').next().unwrap_or_default();
        if header_line.contains(&b'\t') {
            b'\t'
        } else {
            b','
        }
    };

    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let header = csv_reader
        .headers()
        .map_err(|e| anyhow::anyhow!("problem reading header: {}", e))?
        .clone();
    let (format, columns) = Format::detect(&header)?;
    tracing::debug!("detected format {} with columns {:?}", format, &columns);

    let mut result = Vec::new();
    let mut lossy = 0usize;
    for record in csv_reader.byte_records() {
        let record = record.map_err(|e| anyhow::anyhow!("problem parsing record: {}", e))?;
        // Rows with stray non-UTF-8 bytes (e.g., Latin-1 trait names) are kept.
        let record = csv::StringRecord::from_byte_record(record).unwrap_or_else(|e| {
            lossy += 1;
            csv::StringRecord::from_byte_record_lossy(e.into_byte_record())
        });
        result.push(RawAssociation::from_record(&record, format, &columns));
    }
    if lossy > 0 {
        tracing::warn!("{} records with invalid UTF-8 were read lossily", lossy);
    }
    tracing::debug!("read a total of {} records", result.len());

    Ok((format, result))
}

/// Row of the trait metadata file.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
struct TraitMetadata {
    #[serde(alias = "Trait")]
    trait_name: String,
    #[serde(alias = "Child traits", default)]
    child_traits: String,
}

/// Load the trait metadata file.
///
/// # Returns
///
/// Mapping from normalized main trait to its normalized child traits.
///
/// # Errors
///
/// If anything goes wrong, it returns a generic `anyhow::Error`.
pub fn load_trait_metadata<P>(
    path: P,
) -> Result<rustc_hash::FxHashMap<String, BTreeSet<String>>, anyhow::Error>
where
    P: AsRef<Path>,
{
    let reader = open_read(path)?;
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let mut result = rustc_hash::FxHashMap::default();
    for record in csv_reader.deserialize() {
        let record: TraitMetadata =
            record.map_err(|e| anyhow::anyhow!("problem parsing record: {}", e))?;
        let children = record
            .child_traits
            .split(';')
            .map(normalize_trait_name)
            .filter(|child| !child.is_empty() && child != "nan")
            .collect::<BTreeSet<_>>();
        result.insert(normalize_trait_name(&record.trait_name), children);
    }

    Ok(result)
}

/// Write clean associations as TSV.
///
/// # Errors
///
/// If anything goes wrong, it returns a generic `anyhow::Error`.
pub fn write_clean_file<P>(path: P, associations: &[Association]) -> Result<(), anyhow::Error>
where
    P: AsRef<Path>,
{
    let file = std::fs::File::create(path.as_ref())
        .map_err(|e| anyhow::anyhow!("problem creating {}: {}", path.as_ref().display(), e))?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(BufWriter::new(file));
    for association in associations {
        writer
            .serialize(association)
            .map_err(|e| anyhow::anyhow!("problem writing record: {}", e))?;
    }
    writer
        .flush()
        .map_err(|e| anyhow::anyhow!("problem flushing {}: {}", path.as_ref().display(), e))?;

    Ok(())
}

/// Load clean associations written by [`write_clean_file`].
///
/// # Errors
///
/// If anything goes wrong, it returns a generic `anyhow::Error`.
pub fn load_clean_file<P>(path: P) -> Result<Vec<Association>, anyhow::Error>
where
    P: AsRef<Path>,
{
    let reader = open_read(path)?;
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(false)
        .from_reader(reader);
    let mut result = Vec::new();
    for record in csv_reader.deserialize() {
        let record: Association =
            record.map_err(|e| anyhow::anyhow!("problem parsing record: {}", e))?;
        result.push(record);
    }

    Ok(result)
}

/// Load all clean `.tsv` files of `dir` in file name order.
///
/// Files that fail to load are logged and skipped.
///
/// # Returns
///
/// The associations of all readable files and the number of failed files.
pub fn load_clean_dir<P>(dir: P) -> Result<(Vec<Association>, usize), anyhow::Error>
where
    P: AsRef<Path>,
{
    let paths = list_files(dir)?
        .into_iter()
        .filter(|path| path.extension().is_some_and(|ext| ext == "tsv"))
        .collect::<Vec<_>>();
    tracing::info!("loading {} clean trait files", paths.len());

    let mut result = Vec::new();
    let mut failed = 0;
    for path in &paths {
        match load_clean_file(path) {
            Ok(associations) => {
                tracing::debug!("{}: {} associations", path.display(), associations.len());
                result.extend(associations);
            }
            Err(e) => {
                tracing::error!("failed to load {}: {}", path.display(), e);
                failed += 1;
            }
        }
    }

    Ok((result, failed))
}
