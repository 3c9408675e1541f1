//! Commonly used code.

use std::{
    ffi::OsStr,
    fmt::Display,
    fs::File,
    io::{BufReader, Read},
    path::Path,
    str::FromStr,
};

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Assembly to be passed on the command line.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    clap::ValueEnum,
    serde::Deserialize,
    serde::Serialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum Assembly {
    /// GRCh37
    #[strum(serialize = "GRCh37")]
    Grch37,
    /// GRCh38
    #[default]
    #[strum(serialize = "GRCh38")]
    Grch38,
}

/// RefSeq accession versions of `NC_000001` .. `NC_000024` on GRCh37.
///
/// GRCh38 bumped the version of every one of them by exactly one.
const GRCH37_NC_VERSIONS: [u32; 24] = [
    10, 11, 11, 11, 9, 11, 13, 10, 11, 10, 9, 11, 10, 8, 9, 9, 10, 9, 9, 10, 8, 10, 10, 9,
];

/// The mitochondrial accession shared by GRCh37p10+ and GRCh38.
const MT_ACCESSION: &str = "NC_012920.1";

impl Assembly {
    /// Interpret a genome build suffix such as `b38` or `hg19`.
    ///
    /// # Arguments
    ///
    /// * `suffix` - The build suffix, matched case-insensitively.
    ///
    /// # Returns
    ///
    /// The assembly, if `suffix` names one.
    pub fn from_build_suffix(suffix: &str) -> Option<Self> {
        match suffix.to_ascii_lowercase().as_str() {
            "b37" | "hg19" | "grch37" => Some(Assembly::Grch37),
            "b38" | "hg38" | "grch38" => Some(Assembly::Grch38),
            _ => None,
        }
    }

    /// Whether the RefSeq sequence accession is a chromosome of this assembly.
    ///
    /// # Arguments
    ///
    /// * `accession` - RefSeq accession with version, e.g., `NC_000001.11`.
    pub fn has_accession(&self, accession: &str) -> bool {
        if accession == MT_ACCESSION {
            return true;
        }
        let Some((name, version)) = accession.split_once('.') else {
            return false;
        };
        let (Some(number), Ok(version)) = (
            name.strip_prefix("NC_").and_then(|n| n.parse::<usize>().ok()),
            version.parse::<u32>(),
        ) else {
            return false;
        };
        if !(1..=GRCH37_NC_VERSIONS.len()).contains(&number) {
            return false;
        }
        let grch37_version = GRCH37_NC_VERSIONS[number - 1];
        match self {
            Assembly::Grch37 => version == grch37_version,
            Assembly::Grch38 => version == grch37_version + 1,
        }
    }
}

/// Deserialize `Option::None` from `"NA"` or an empty field.
///
/// Any other value is parsed with `FromStr`, so this works for strings as
/// well as for numbers.
pub fn deserialize_option_na<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let value: String = Deserialize::deserialize(deserializer)?;
    match value.trim() {
        "" | "NA" => Ok(None),
        value => value.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Serialize `Option::None` as `"NA"`.
pub fn serialize_option_na<S, T>(x: &Option<T>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize,
{
    match x {
        Some(x) => s.serialize_some(x),
        None => s.serialize_str("NA"),
    }
}

/// Open a file for reading, transparently decompressing `.gz` files.
///
/// # Arguments
///
/// * `path` - Path to the file to read.
///
/// # Errors
///
/// If the file cannot be opened, it returns a generic `anyhow::Error`.
pub fn open_read<P>(path: P) -> Result<BufReader<Box<dyn Read>>, anyhow::Error>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let is_gzipped = path.extension() == Some(OsStr::new("gz"));
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("problem opening file {}: {}", path.display(), e))?;
    let file: Box<dyn Read> = if is_gzipped {
        Box::new(flate2::read::MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };

    Ok(BufReader::new(file))
}

/// List the regular files in `dir`, sorted by file name.
///
/// # Errors
///
/// If the directory cannot be read, it returns a generic `anyhow::Error`.
pub fn list_files<P>(dir: P) -> Result<Vec<std::path::PathBuf>, anyhow::Error>
where
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    let mut result = std::fs::read_dir(dir)
        .map_err(|e| anyhow::anyhow!("problem reading directory {}: {}", dir.display(), e))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("problem listing directory {}: {}", dir.display(), e))?;
    result.retain(|path| path.is_file());
    result.sort();

    Ok(result)
}
