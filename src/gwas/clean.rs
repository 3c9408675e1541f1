//! Row policy for cleaning raw GWAS associations.

use std::{collections::BTreeSet, ops::AddAssign, path::Path};

use super::{
    io::{self, normalize_trait_name, RawAssociation},
    Association, Error,
};
use crate::variant::{Normalizer, VariantKey};

/// Counts of what happened to the rows of one or more files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CleanStats {
    /// Rows read from the raw file.
    pub rows_read: usize,
    /// Rows written to the clean file.
    pub rows_kept: usize,
    /// Rows dropped because their variant could not be normalized.
    pub unparsable_variant: usize,
    /// Rows dropped for lack of a parseable p-value.
    pub missing_p_value: usize,
    /// Rows dropped for a p-value outside of `(0, 1]`.
    pub invalid_significance: usize,
    /// Rows dropped because their trait is not retained.
    pub filtered_trait: usize,
    /// Less significant duplicates of a (variant, trait) pair.
    pub duplicates: usize,
}

impl AddAssign for CleanStats {
    fn add_assign(&mut self, rhs: Self) {
        self.rows_read += rhs.rows_read;
        self.rows_kept += rhs.rows_kept;
        self.unparsable_variant += rhs.unparsable_variant;
        self.missing_p_value += rhs.missing_p_value;
        self.invalid_significance += rhs.invalid_significance;
        self.filtered_trait += rhs.filtered_trait;
        self.duplicates += rhs.duplicates;
    }
}

/// Parse a p-value in plain (`2e-8`) or GWAS catalog (`2 x 10-8`) notation.
///
/// # Errors
///
/// `Error::MissingPValue` if the value cannot be parsed and
/// `Error::InvalidSignificance` if it is not in `(0, 1]`.
pub fn parse_p_value(value: &str) -> Result<f64, Error> {
    let value = value.trim();
    let missing = || Error::MissingPValue(value.to_string());

    let p_value = match value.split_once(" x 10-") {
        Some((mantissa, exponent)) => {
            let mantissa_value = mantissa.trim().parse::<f64>().map_err(|_| missing())?;
            let exponent = exponent.trim().parse::<u32>().map_err(|_| missing())?;
            let p_value = format!("{}e-{}", mantissa.trim(), exponent)
                .parse::<f64>()
                .map_err(|_| missing())?;
            clamp_underflow(p_value, mantissa_value)
        }
        None => {
            let p_value = value.parse::<f64>().map_err(|_| missing())?;
            let mantissa_value = value
                .split(['e', 'E'])
                .next()
                .and_then(|mantissa| mantissa.parse::<f64>().ok())
                .unwrap_or_default();
            clamp_underflow(p_value, mantissa_value)
        }
    };

    if p_value > 0.0 && p_value <= 1.0 {
        Ok(p_value)
    } else {
        Err(Error::InvalidSignificance(p_value))
    }
}

/// Extremely small p-values underflow `f64` to zero.
fn clamp_underflow(p_value: f64, mantissa: f64) -> f64 {
    if p_value == 0.0 && mantissa > 0.0 {
        f64::MIN_POSITIVE
    } else {
        p_value
    }
}

/// Parse an effect size cell such as `1.3` or `0.02 unit increase`.
fn parse_effect_size(value: &str) -> Option<f64> {
    value
        .split_whitespace()
        .next()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// Cleans the raw rows of one trait file.
#[derive(Debug)]
pub struct Cleaner<'a> {
    /// Normalizer for variant tokens.
    normalizer: &'a Normalizer,
    /// The file's main trait.
    main_trait: String,
    /// Retained traits, `None` to retain all.
    retained_traits: Option<BTreeSet<String>>,
}

impl<'a> Cleaner<'a> {
    /// Create a new `Cleaner`.
    ///
    /// # Arguments
    ///
    /// * `normalizer` - Normalizer for variant tokens.
    /// * `main_trait` - The main trait of the file, used for rows without trait.
    /// * `metadata` - Trait metadata; if it lists `main_trait`, only the main
    ///   trait and its children are retained.
    pub fn new(
        normalizer: &'a Normalizer,
        main_trait: &str,
        metadata: Option<&rustc_hash::FxHashMap<String, BTreeSet<String>>>,
    ) -> Self {
        let main_trait = normalize_trait_name(main_trait);
        let retained_traits = match metadata.map(|metadata| metadata.get(&main_trait)) {
            Some(Some(children)) => {
                let mut retained = children.clone();
                retained.insert(main_trait.clone());
                Some(retained)
            }
            Some(None) => {
                tracing::warn!("no trait metadata for {:?}, retaining all traits", &main_trait);
                None
            }
            None => None,
        };

        Self {
            normalizer,
            main_trait,
            retained_traits,
        }
    }

    /// The file's main trait.
    pub fn main_trait(&self) -> &str {
        &self.main_trait
    }

    /// Load and clean a raw file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is structurally unusable.
    pub fn clean_file<P>(&self, path: P) -> Result<(Vec<Association>, CleanStats), anyhow::Error>
    where
        P: AsRef<Path>,
    {
        let (format, rows) = io::load_raw_file(path.as_ref())?;
        tracing::debug!("{} has format {}", path.as_ref().display(), format);
        Ok(self.clean(rows))
    }

    /// Clean raw rows.
    ///
    /// Rows without parseable variant or p-value are dropped and counted.
    /// Of several rows for the same (variant, trait) pair, the one with the
    /// smallest p-value is kept; on ties the first one wins.  The result is
    /// in order of first appearance of each pair.
    pub fn clean<I>(&self, rows: I) -> (Vec<Association>, CleanStats)
    where
        I: IntoIterator<Item = RawAssociation>,
    {
        let mut stats = CleanStats::default();
        let mut result: Vec<Association> = Vec::new();
        let mut seen: rustc_hash::FxHashMap<(VariantKey, String), usize> = Default::default();
        let mut gene_mismatch = BTreeSet::new();

        for row in rows {
            stats.rows_read += 1;

            let trait_name = row
                .trait_name
                .as_deref()
                .map(normalize_trait_name)
                .unwrap_or_else(|| self.main_trait.clone());
            if let Some(retained) = &self.retained_traits {
                if !retained.contains(&trait_name) {
                    stats.filtered_trait += 1;
                    continue;
                }
            }

            let (key, association) = match self.convert(row, trait_name) {
                Ok(converted) => converted,
                Err(e) => {
                    tracing::debug!("dropping row: {}", &e);
                    match e {
                        Error::MissingPValue(_) => stats.missing_p_value += 1,
                        Error::InvalidSignificance(_) => stats.invalid_significance += 1,
                        Error::UnparsableVariant(_) => stats.unparsable_variant += 1,
                        // Only raised for headers.
                        Error::MissingRequiredColumn(_) => {}
                    }
                    continue;
                }
            };

            match seen.entry((key, association.trait_name.clone())) {
                std::collections::hash_map::Entry::Occupied(entry) => {
                    stats.duplicates += 1;
                    let current = &mut result[*entry.get()];
                    if current.mapped_genes != association.mapped_genes {
                        gene_mismatch.insert(current.variant.clone());
                    }
                    if association.p_value < current.p_value {
                        *current = association;
                    }
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(result.len());
                    result.push(association);
                }
            }
        }

        for variant in &gene_mismatch {
            tracing::warn!("found variant {} with differing mapped gene values", variant);
        }
        stats.rows_kept = result.len();

        (result, stats)
    }

    /// Convert a raw row into the canonical key and the association.
    fn convert(
        &self,
        row: RawAssociation,
        trait_name: String,
    ) -> Result<(VariantKey, Association), Error> {
        let key = match row.variant.as_deref().map(|v| self.normalizer.normalize(v)) {
            Some(Ok(key)) => key,
            result => {
                // Some catalog rows only carry the position in `Location`.
                let fallback = row
                    .location
                    .as_deref()
                    .and_then(|location| self.normalizer.normalize(location).ok());
                match (fallback, result) {
                    (Some(key), _) => key,
                    (None, Some(Err(e))) => return Err(e.into()),
                    (None, _) => {
                        return Err(Error::UnparsableVariant(
                            crate::variant::Error::UnparsableVariant {
                                token: String::new(),
                                reason: "no variant token",
                            },
                        ))
                    }
                }
            }
        };
        let p_value = parse_p_value(row.p_value.as_deref().unwrap_or_default())?;

        let association = Association {
            variant: key.to_string(),
            trait_name,
            p_value,
            effect_size: row.effect.as_deref().and_then(parse_effect_size),
            risk_allele: row.risk_allele,
            mapped_genes: row.mapped_genes,
        };

        Ok((key, association))
    }
}

#[cfg(test)]
mod test {
    use super::{CleanStats, Cleaner};
    use crate::common::Assembly;
    use crate::gwas::{io::RawAssociation, Association, Error};
    use crate::variant::{lookup, Normalizer};

    fn raw(variant: &str, p_value: &str, trait_name: &str) -> RawAssociation {
        RawAssociation {
            variant: Some(variant.into()),
            p_value: Some(p_value.into()),
            effect: Some("1.3".into()),
            risk_allele: Some("A".into()),
            trait_name: Some(trait_name.into()),
            ..Default::default()
        }
    }

    #[rstest::rstest]
    #[case("2 x 10-8", 2e-8)]
    #[case("1 x 10-5", 1e-5)]
    #[case("6E-9", 6e-9)]
    #[case("0.05", 0.05)]
    #[case("1", 1.0)]
    #[case("1 x 10-400", f64::MIN_POSITIVE)]
    #[case("1e-400", f64::MIN_POSITIVE)]
    #[case("2.5E-512", f64::MIN_POSITIVE)]
    fn parse_p_value(#[case] value: &str, #[case] expected: f64) -> Result<(), anyhow::Error> {
        assert_eq!(super::parse_p_value(value)?, expected);

        Ok(())
    }

    #[rstest::rstest]
    #[case("")]
    #[case("NR")]
    #[case("x 10-5")]
    #[case("1 x 10-abc")]
    fn parse_p_value_missing(#[case] value: &str) {
        assert!(matches!(
            super::parse_p_value(value),
            Err(Error::MissingPValue(_))
        ));
    }

    #[rstest::rstest]
    #[case("0")]
    #[case("0 x 10-5")]
    #[case("0e-400")]
    #[case("-1e-400")]
    #[case("1.5")]
    #[case("2 x 10-0")]
    #[case("-0.1")]
    #[case("NaN")]
    fn parse_p_value_invalid(#[case] value: &str) {
        assert!(matches!(
            super::parse_p_value(value),
            Err(Error::InvalidSignificance(_))
        ));
    }

    #[rstest::rstest]
    #[case("1.3", Some(1.3))]
    #[case("0.02 unit increase", Some(0.02))]
    #[case("[1.1-1.3]", None)]
    #[case("", None)]
    fn parse_effect_size(#[case] value: &str, #[case] expected: Option<f64>) {
        assert_eq!(super::parse_effect_size(value), expected);
    }

    #[test]
    fn clean_keeps_most_significant_duplicate() {
        let normalizer = Normalizer::default();
        let cleaner = Cleaner::new(&normalizer, "depression", None);

        let (associations, stats) = cleaner.clean(vec![
            raw("rs123", "0.01", "depression"),
            raw("rs123", "0.00001", "Depression"),
        ]);

        assert_eq!(
            associations,
            vec![Association {
                variant: "rs123".into(),
                trait_name: "depression".into(),
                p_value: 0.00001,
                effect_size: Some(1.3),
                risk_allele: Some("A".into()),
                mapped_genes: vec![],
            }]
        );
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn clean_dedup_across_formats() -> Result<(), anyhow::Error> {
        let normalizer = Normalizer::new(
            Assembly::Grch38,
            Some(lookup::Data::load("tests/data/variant/lookup_table.txt")?),
        );
        let cleaner = Cleaner::new(&normalizer, "depression", None);

        let (associations, stats) = cleaner.clean(vec![
            raw("chr1:1000", "0.001", "depression"),
            raw("rs123", "0.01", "depression"),
            raw("rs123", "0.01", "anxiety"),
        ]);

        assert_eq!(associations.len(), 2);
        assert_eq!(associations[0].variant, "rs123");
        assert_eq!(associations[0].p_value, 0.001);
        assert_eq!(associations[1].trait_name, "anxiety");
        assert_eq!(stats.duplicates, 1);

        Ok(())
    }

    #[test]
    fn clean_counts_dropped_rows() {
        let normalizer = Normalizer::default();
        let cleaner = Cleaner::new(&normalizer, "depression", None);

        let (associations, stats) = cleaner.clean(vec![
            raw("undefined", "0.01", "depression"),
            raw("rs1", "", "depression"),
            raw("rs2", "1.5", "depression"),
            RawAssociation {
                variant: Some("undefined".into()),
                location: Some("6:55564517".into()),
                p_value: Some("2 x 10-6".into()),
                ..Default::default()
            },
        ]);

        assert_eq!(associations.len(), 1);
        assert_eq!(associations[0].variant, "6:55564517");
        // Rows without trait get the file's main trait.
        assert_eq!(associations[0].trait_name, "depression");
        assert_eq!(
            stats,
            CleanStats {
                rows_read: 4,
                rows_kept: 1,
                unparsable_variant: 1,
                missing_p_value: 1,
                invalid_significance: 1,
                filtered_trait: 0,
                duplicates: 0,
            }
        );
    }

    #[tracing_test::traced_test]
    #[test]
    fn clean_file_with_metadata() -> Result<(), anyhow::Error> {
        let normalizer = Normalizer::new(
            Assembly::Grch38,
            Some(lookup::Data::load("tests/data/variant/lookup_table.txt")?),
        );
        let metadata =
            crate::gwas::io::load_trait_metadata("tests/data/gwas/gwas_trait_metadata.csv")?;
        let cleaner = Cleaner::new(&normalizer, "schizophrenia", Some(&metadata));

        let (associations, stats) =
            cleaner.clean_file("tests/data/gwas/raw/schizophrenia_gwas_catalog_2022.csv")?;

        assert_eq!(
            associations
                .iter()
                .map(|a| (a.variant.as_str(), a.trait_name.as_str(), a.p_value))
                .collect::<Vec<_>>(),
            vec![
                ("rs123", "schizophrenia", 1e-5),
                ("rs456", "schizophrenia", 3e-8),
                ("6:55564517", "schizoaffective disorder", 2e-6),
                ("rs123", "treatment-resistant schizophrenia", 1e-3),
            ]
        );
        assert_eq!(associations[3].effect_size, Some(0.02));
        assert_eq!(associations[2].risk_allele, None);
        assert_eq!(
            stats,
            CleanStats {
                rows_read: 9,
                rows_kept: 4,
                unparsable_variant: 1,
                missing_p_value: 1,
                invalid_significance: 1,
                filtered_trait: 1,
                duplicates: 1,
            }
        );

        Ok(())
    }

    #[test]
    fn clean_file_summary_statistics() -> Result<(), anyhow::Error> {
        let normalizer = Normalizer::default();
        let cleaner = Cleaner::new(&normalizer, "anxiety", None);

        let (associations, stats) = cleaner.clean_file("tests/data/gwas/sumstats/anxiety.tsv")?;

        assert_eq!(associations.len(), 2);
        assert_eq!(associations[0].variant, "rs123");
        assert_eq!(associations[0].trait_name, "anxiety");
        assert_eq!(associations[0].effect_size, Some(1.2));
        assert_eq!(associations[1].variant, "1:2000");
        assert_eq!(stats.missing_p_value, 1);
        assert_eq!(stats.invalid_significance, 1);

        Ok(())
    }
}
