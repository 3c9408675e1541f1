//! Canonical identity of genomic variants.
//!
//! Variants reach the pipeline as dbSNP rsIDs (`rs123`), as colon-separated
//! positions (`chr1:1000`, `1:1000:A:G`), and as GTEx-style underscore tokens
//! (`chr1_1000_A_G_b38`).  [`VariantKey`] parses all of them; [`Normalizer`]
//! additionally maps positional keys onto rsIDs via a [`lookup::Data`] table
//! so that every representation of one physical variant ends up as the same
//! key.

pub mod lookup;

use std::{fmt, path::PathBuf, str::FromStr};

use clap::Parser;

use crate::common::Assembly;

/// Problems with deriving a variant key from a token.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The token does not match any known variant format.
    #[error("unparsable variant {token:?}: {reason}")]
    UnparsableVariant {
        /// The offending token.
        token: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// The token carries a build suffix for another assembly.
    #[error("variant {token:?} is on {found} but {expected} is configured")]
    AssemblyMismatch {
        /// The offending token.
        token: String,
        /// The assembly named by the token's build suffix.
        found: Assembly,
        /// The configured assembly.
        expected: Assembly,
    },
}

impl Error {
    fn unparsable(token: &str, reason: &'static str) -> Self {
        Error::UnparsableVariant {
            token: token.to_string(),
            reason,
        }
    }
}

/// A variant described by its position and, if known, its alleles.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Locus {
    /// Chromosome without `chr` prefix (`1`..`22`, `X`, `Y`, `MT`).
    pub chrom: String,
    /// 1-based position.
    pub pos: u64,
    /// Reference allele.
    pub reference: Option<String>,
    /// Alternative allele.
    pub alternative: Option<String>,
}

impl Locus {
    /// The same locus without allele information.
    pub fn without_alleles(&self) -> Self {
        Self {
            chrom: self.chrom.clone(),
            pos: self.pos,
            reference: None,
            alternative: None,
        }
    }
}

/// Canonical variant identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VariantKey {
    /// dbSNP reference SNP identifier, the number after `rs`.
    Rsid(u64),
    /// Positional description.
    Locus(Locus),
}

impl VariantKey {
    /// The rsID number, if this is an rsID key.
    pub fn rsid(&self) -> Option<u64> {
        match self {
            VariantKey::Rsid(rsid) => Some(*rsid),
            VariantKey::Locus(_) => None,
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantKey::Rsid(rsid) => write!(f, "rs{}", rsid),
            VariantKey::Locus(Locus {
                chrom,
                pos,
                reference: Some(reference),
                alternative: Some(alternative),
            }) => write!(f, "{}:{}:{}:{}", chrom, pos, reference, alternative),
            VariantKey::Locus(Locus { chrom, pos, .. }) => write!(f, "{}:{}", chrom, pos),
        }
    }
}

impl FromStr for VariantKey {
    type Err = Error;

    /// Parse any supported token, ignoring the build suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Token::parse(s).map(|token| token.key)
    }
}

/// A parsed token: the key and the build the token claims to be on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The variant key.
    pub key: VariantKey,
    /// Assembly from the build suffix, if any.
    pub assembly: Option<Assembly>,
}

impl Token {
    /// Parse a variant token in any of the supported formats.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnparsableVariant` if the token matches no format.
    pub fn parse(token: &str) -> Result<Self, Error> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(Error::unparsable(token, "empty token"));
        }

        if let Some(digits) = strip_prefix_ignore_case(trimmed, "rs") {
            let rsid = digits
                .parse::<u64>()
                .map_err(|_| Error::unparsable(token, "rsID without numeric identifier"))?;
            return Ok(Self {
                key: VariantKey::Rsid(rsid),
                assembly: None,
            });
        }

        let mut fields = if trimmed.contains(':') {
            trimmed.split(':').collect::<Vec<_>>()
        } else if trimmed.contains('_') {
            trimmed.split('_').collect::<Vec<_>>()
        } else {
            return Err(Error::unparsable(token, "no recognized variant format"));
        };

        let assembly = match fields.last().and_then(|f| Assembly::from_build_suffix(f)) {
            Some(assembly) if fields.len() > 2 => {
                fields.pop();
                Some(assembly)
            }
            _ => None,
        };

        let (chrom, pos, reference, alternative) = match fields.as_slice() {
            [chrom, pos] => (*chrom, *pos, None, None),
            // GWAS catalog shorthand for insertions/deletions without alleles.
            [chrom, pos, marker]
                if marker.eq_ignore_ascii_case("i") || marker.eq_ignore_ascii_case("d") =>
            {
                (*chrom, *pos, None, None)
            }
            [chrom, pos, reference, alternative] => {
                (*chrom, *pos, Some(*reference), Some(*alternative))
            }
            [_, _, _] => return Err(Error::unparsable(token, "malformed allele field")),
            _ => return Err(Error::unparsable(token, "unexpected number of fields")),
        };

        let chrom =
            normalize_chrom(chrom).ok_or_else(|| Error::unparsable(token, "invalid chromosome"))?;
        let pos = pos
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|pos| *pos > 0)
            .ok_or_else(|| Error::unparsable(token, "non-numeric position"))?;
        let allele = |allele: &str| {
            normalize_allele(allele)
                .ok_or_else(|| Error::unparsable(token, "malformed allele field"))
        };
        let reference = reference.map(allele).transpose()?;
        let alternative = alternative.map(allele).transpose()?;

        Ok(Self {
            key: VariantKey::Locus(Locus {
                chrom,
                pos,
                reference,
                alternative,
            }),
            assembly,
        })
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match (s.get(..prefix.len()), s.get(prefix.len()..)) {
        (Some(head), Some(tail)) if head.eq_ignore_ascii_case(prefix) => Some(tail),
        _ => None,
    }
}

/// Canonical chromosome name: no `chr` prefix, uppercase, `M` as `MT`.
fn normalize_chrom(chrom: &str) -> Option<String> {
    let chrom = chrom.trim();
    let chrom = strip_prefix_ignore_case(chrom, "chr")
        .unwrap_or(chrom)
        .to_ascii_uppercase();
    let valid = match chrom.as_str() {
        "X" | "Y" | "MT" => true,
        "M" => return Some("MT".to_string()),
        autosome => {
            autosome.bytes().all(|b| b.is_ascii_digit())
                && !autosome.starts_with('0')
                && matches!(autosome.parse::<u8>(), Ok(1..=22))
        }
    };
    valid.then_some(chrom)
}

/// Canonical allele: uppercase nucleotides.
fn normalize_allele(allele: &str) -> Option<String> {
    let allele = allele.trim().to_ascii_uppercase();
    if !allele.is_empty() && allele.chars().all(|c| matches!(c, 'A' | 'C' | 'G' | 'T' | 'N')) {
        Some(allele)
    } else {
        None
    }
}

/// Command line arguments controlling variant normalization.
#[derive(Parser, Debug, Clone)]
#[group(id = "normalize")]
pub struct Args {
    /// The assembly that positional variants are expected on.
    #[clap(long, value_enum, default_value_t = Assembly::Grch38)]
    pub assembly: Assembly,
    /// Path to a GTEx-style lookup table mapping `variant_id` to rsIDs.
    #[clap(long)]
    pub path_lookup_table: Option<PathBuf>,
}

/// Derives canonical variant keys from source tokens.
#[derive(Debug, Default)]
pub struct Normalizer {
    /// The configured assembly.
    assembly: Assembly,
    /// Optional mapping from positions to rsIDs.
    lookup: Option<lookup::Data>,
}

impl Normalizer {
    /// Create a new `Normalizer`.
    ///
    /// # Arguments
    ///
    /// * `assembly` - Assembly that positional tokens must be on.
    /// * `lookup` - Optional lookup table used to map positions to rsIDs.
    pub fn new(assembly: Assembly, lookup: Option<lookup::Data>) -> Self {
        Self { assembly, lookup }
    }

    /// Construct from command line arguments, loading the lookup table if given.
    ///
    /// # Errors
    ///
    /// If the lookup table cannot be loaded, it returns a generic `anyhow::Error`.
    pub fn from_args(args: &Args) -> Result<Self, anyhow::Error> {
        let lookup = args
            .path_lookup_table
            .as_ref()
            .map(lookup::Data::load)
            .transpose()
            .map_err(|e| anyhow::anyhow!("problem loading variant lookup table: {}", e))?;
        Ok(Self::new(args.assembly, lookup))
    }

    /// The configured assembly.
    pub fn assembly(&self) -> Assembly {
        self.assembly
    }

    /// Derive the canonical key for `token`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnparsableVariant` for tokens in no known format and
    /// `Error::AssemblyMismatch` for tokens on another assembly.
    pub fn normalize(&self, token: &str) -> Result<VariantKey, Error> {
        let parsed = Token::parse(token)?;
        if let Some(found) = parsed.assembly {
            if found != self.assembly {
                return Err(Error::AssemblyMismatch {
                    token: token.to_string(),
                    found,
                    expected: self.assembly,
                });
            }
        }

        Ok(self.canonicalize(parsed.key))
    }

    /// Map positional keys onto rsIDs where the lookup table knows them.
    pub fn canonicalize(&self, key: VariantKey) -> VariantKey {
        match (&key, &self.lookup) {
            (VariantKey::Locus(locus), Some(lookup)) => lookup
                .rsid_for(locus)
                .map(VariantKey::Rsid)
                .unwrap_or(key),
            _ => key,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Error, Locus, Normalizer, Token, VariantKey};
    use crate::common::Assembly;

    fn locus(chrom: &str, pos: u64, alleles: Option<(&str, &str)>) -> VariantKey {
        VariantKey::Locus(Locus {
            chrom: chrom.to_string(),
            pos,
            reference: alleles.map(|(r, _)| r.to_string()),
            alternative: alleles.map(|(_, a)| a.to_string()),
        })
    }

    #[rstest::rstest]
    #[case("rs123", VariantKey::Rsid(123))]
    #[case(" RS123 ", VariantKey::Rsid(123))]
    #[case("chr6:55564517", locus("6", 55564517, None))]
    #[case("6:55564517", locus("6", 55564517, None))]
    #[case("chrX:100", locus("X", 100, None))]
    #[case("chrm:100", locus("MT", 100, None))]
    #[case("MT:100", locus("MT", 100, None))]
    #[case("chr7_140700006_I", locus("7", 140700006, None))]
    #[case("chr1_1000_a_g_b38", locus("1", 1000, Some(("A", "G"))))]
    #[case("1:1000:A:GT", locus("1", 1000, Some(("A", "GT"))))]
    #[case("1:1000:A:G:GRCh37", locus("1", 1000, Some(("A", "G"))))]
    fn parse_token(#[case] token: &str, #[case] expected: VariantKey) -> Result<(), anyhow::Error> {
        assert_eq!(token.parse::<VariantKey>()?, expected);

        Ok(())
    }

    #[rstest::rstest]
    #[case("")]
    #[case("undefined")]
    #[case("rsabc")]
    #[case("chr:100")]
    #[case("chr23:100")]
    #[case("chr01:100")]
    #[case("chr+5:100")]
    #[case("chr1:abc")]
    #[case("chr1:0")]
    #[case("chr1_100_A_Z_b38")]
    #[case("chr1_100_AG")]
    #[case("chr1:100:A")]
    #[case("1:2:3:4:5:6")]
    fn parse_token_fails(#[case] token: &str) {
        assert!(matches!(
            token.parse::<VariantKey>(),
            Err(Error::UnparsableVariant { .. })
        ));
    }

    #[test]
    fn token_build_suffix() -> Result<(), anyhow::Error> {
        let token = Token::parse("chr1_1000_A_G_b37")?;
        assert_eq!(token.assembly, Some(Assembly::Grch37));
        let token = Token::parse("chr1:1000")?;
        assert_eq!(token.assembly, None);

        Ok(())
    }

    #[rstest::rstest]
    #[case(VariantKey::Rsid(42))]
    #[case(locus("X", 5, None))]
    #[case(locus("22", 17, Some(("AC", "T"))))]
    fn display_is_canonical(#[case] key: VariantKey) -> Result<(), anyhow::Error> {
        assert_eq!(key.to_string().parse::<VariantKey>()?, key);

        Ok(())
    }

    #[test]
    fn normalize_rejects_other_assembly() {
        let normalizer = Normalizer::new(Assembly::Grch38, None);
        assert!(matches!(
            normalizer.normalize("chr1_1000_A_G_b37"),
            Err(Error::AssemblyMismatch { .. })
        ));
    }

    #[test]
    fn normalize_without_lookup_keeps_positions() -> Result<(), anyhow::Error> {
        let normalizer = Normalizer::new(Assembly::Grch38, None);
        assert_eq!(
            normalizer.normalize("chr1_1000_A_G_b38")?,
            locus("1", 1000, Some(("A", "G")))
        );
        assert_eq!(
            normalizer.normalize("1:1000:a:g")?,
            normalizer.normalize("chr1_1000_A_G_b38")?
        );

        Ok(())
    }

    /// All source formats of the same physical variant normalize to one key.
    #[rstest::rstest]
    #[case("rs123")]
    #[case("RS123")]
    #[case("chr1_1000_A_G_b38")]
    #[case("chr1_1000_a_g")]
    #[case("1:1000:A:G")]
    #[case("chr1:1000")]
    #[case("1:1000")]
    fn normalize_format_invariance(#[case] token: &str) -> Result<(), anyhow::Error> {
        let normalizer = Normalizer::new(
            Assembly::Grch38,
            Some(super::lookup::Data::load("tests/data/variant/lookup_table.txt")?),
        );

        assert_eq!(normalizer.normalize(token)?, VariantKey::Rsid(123));

        Ok(())
    }
}
