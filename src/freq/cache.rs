//! Append-only on-disk cache of allele frequencies.
//!
//! The cache is a TSV file with columns `variant` and `frequencies`.  It is
//! loaded completely on open; each new entry is appended and flushed right
//! away so that an interrupted run loses at most the entry being written.

use std::{
    collections::BTreeMap,
    fmt,
    fs::{File, OpenOptions},
    path::Path,
    str::FromStr,
};

use crate::variant::VariantKey;

/// Header of the cache file.
const HEADER: [&str; 2] = ["variant", "frequencies"];

/// Sentinel for a variant without frequency data.
const NOT_FOUND: &str = "NA";

/// Frequency per allele of one variant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlleleFrequencies(BTreeMap<String, f64>);

impl AlleleFrequencies {
    /// Create from `(allele, frequency)` pairs; alleles are uppercased.
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(allele, frequency)| (allele.as_ref().to_ascii_uppercase(), frequency))
                .collect(),
        )
    }

    /// Frequency of `allele`, if known.
    pub fn for_allele(&self, allele: &str) -> Option<f64> {
        self.0.get(&allele.to_ascii_uppercase()).copied()
    }

    /// Add the frequency of `allele` unless it is already known.
    pub fn insert_first(&mut self, allele: &str, frequency: f64) {
        self.0
            .entry(allele.to_ascii_uppercase())
            .or_insert(frequency);
    }

    /// Whether no allele has a frequency.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of alleles with a frequency.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for AlleleFrequencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (allele, frequency)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", allele, frequency)?;
        }
        Ok(())
    }
}

impl FromStr for AlleleFrequencies {
    type Err = anyhow::Error;

    /// Parse `A=0.12,G=0.88`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = Self::default();
        for pair in s.split(',') {
            let (allele, frequency) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("missing '=' in {:?}", pair))?;
            let frequency = frequency
                .parse::<f64>()
                .map_err(|e| anyhow::anyhow!("invalid frequency in {:?}: {}", pair, e))?;
            if allele.is_empty() || !(0.0..=1.0).contains(&frequency) {
                anyhow::bail!("invalid allele frequency {:?}", pair);
            }
            result.insert_first(allele, frequency);
        }
        Ok(result)
    }
}

/// A cached lookup result.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    /// The source reported these frequencies.
    Found(AlleleFrequencies),
    /// The lookup failed or the source has no data; not retried.
    NotFound,
}

impl Entry {
    /// The frequencies, if found.
    pub fn found(&self) -> Option<&AlleleFrequencies> {
        match self {
            Entry::Found(frequencies) => Some(frequencies),
            Entry::NotFound => None,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Found(frequencies) => write!(f, "{}", frequencies),
            Entry::NotFound => write!(f, "{}", NOT_FOUND),
        }
    }
}

impl FromStr for Entry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == NOT_FOUND {
            Ok(Entry::NotFound)
        } else {
            s.parse().map(Entry::Found)
        }
    }
}

/// In-memory view of the cache file plus the handle new entries go to.
#[derive(Debug, Default)]
pub struct Cache {
    /// All known entries.
    entries: rustc_hash::FxHashMap<VariantKey, Entry>,
    /// Writer appending to the cache file; `None` for read-only caches.
    writer: Option<csv::Writer<File>>,
}

impl Cache {
    /// Open the cache file at `path` for reading and appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or opened for appending.
    pub fn open<P>(path: P) -> Result<Self, anyhow::Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let content = if path.exists() {
            std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("problem reading cache {}: {}", path.display(), e))?
        } else {
            Vec::new()
        };
        let complete = complete_lines(&content, path);
        let entries = parse_entries(complete);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("problem opening cache {}: {}", path.display(), e))?;
        // Drop a line left behind by an interrupted write.
        if complete.len() < content.len() {
            file.set_len(complete.len() as u64).map_err(|e| {
                anyhow::anyhow!("problem truncating cache {}: {}", path.display(), e)
            })?;
        }
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(file);
        if complete.is_empty() {
            writer.write_record(HEADER)?;
            writer.flush()?;
        }
        tracing::debug!("opened cache {} with {} entries", path.display(), entries.len());

        Ok(Self {
            entries,
            writer: Some(writer),
        })
    }

    /// Load the cache file at `path` without the ability to persist new entries.
    ///
    /// A missing file yields an empty cache.
    pub fn load<P>(path: P) -> Result<Self, anyhow::Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("cache {} does not exist, starting empty", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("problem reading cache {}: {}", path.display(), e))?;

        Ok(Self {
            entries: parse_entries(complete_lines(&content, path)),
            writer: None,
        })
    }

    /// The entry for `key`, if any.
    pub fn get(&self, key: &VariantKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Whether there is an entry for `key`.
    pub fn contains(&self, key: &VariantKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Record `entry` for `key` unless an entry exists already.
    ///
    /// Returns whether the entry was new.  New entries are appended to the
    /// cache file and flushed.
    pub fn insert(&mut self, key: VariantKey, entry: Entry) -> Result<bool, anyhow::Error> {
        if self.entries.contains_key(&key) {
            return Ok(false);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer
                .write_record([key.to_string(), entry.to_string()])
                .map_err(|e| anyhow::anyhow!("problem writing cache entry for {}: {}", &key, e))?;
            writer
                .flush()
                .map_err(|e| anyhow::anyhow!("problem flushing cache: {}", e))?;
        }
        self.entries.insert(key, entry);
        Ok(true)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The part of `content` up to and including its last line break.
///
/// An unterminated last line is left over from an interrupted write; it may
/// still parse but its value cannot be trusted.
fn complete_lines<'a>(content: &'a [u8], path: &Path) -> &'a [u8] {
    if content.is_empty() || content.ends_with(b"\n") {
        return content;
    }
    let end = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    tracing::warn!(
        "skipping interrupted last line of cache {}: {:?}",
        path.display(),
        String::from_utf8_lossy(&content[end..])
    );
    &content[..end]
}

/// Parse cache file content; the first entry for a key wins and malformed
/// lines are skipped.
fn parse_entries(content: &[u8]) -> rustc_hash::FxHashMap<VariantKey, Entry> {
    let mut entries = rustc_hash::FxHashMap::default();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(content);

    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("skipping unreadable cache line: {}", e);
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let parsed = match (record.get(0), record.get(1), record.len()) {
            (Some(key), Some(entry), 2) => key
                .parse::<VariantKey>()
                .map_err(anyhow::Error::from)
                .and_then(|key| Ok((key, entry.parse::<Entry>()?))),
            _ => Err(anyhow::anyhow!("expected 2 fields, got {}", record.len())),
        };
        match parsed {
            Ok((key, entry)) => {
                entries.entry(key).or_insert(entry);
            }
            Err(e) => tracing::warn!("skipping malformed cache line {}: {}", line, e),
        }
    }

    entries
}

#[cfg(test)]
mod test {
    use super::{AlleleFrequencies, Cache, Entry};
    use crate::variant::{Locus, VariantKey};

    #[rstest::rstest]
    #[case("A=0.12,G=0.88", Some(0.12), Some(0.88))]
    #[case("a=0.5", Some(0.5), None)]
    #[case("G=1", None, Some(1.0))]
    fn allele_frequencies_from_str(
        #[case] value: &str,
        #[case] a: Option<f64>,
        #[case] g: Option<f64>,
    ) -> Result<(), anyhow::Error> {
        let frequencies = value.parse::<AlleleFrequencies>()?;

        assert_eq!(frequencies.for_allele("A"), a);
        assert_eq!(frequencies.for_allele("g"), g);

        Ok(())
    }

    #[rstest::rstest]
    #[case("")]
    #[case("A")]
    #[case("A=")]
    #[case("=0.5")]
    #[case("A=1.5")]
    fn allele_frequencies_from_str_fails(#[case] value: &str) {
        assert!(value.parse::<AlleleFrequencies>().is_err());
    }

    #[test]
    fn entry_display() {
        let found = Entry::Found(AlleleFrequencies::new([("G", 0.88), ("a", 0.12)]));

        assert_eq!(found.to_string(), "A=0.12,G=0.88");
        assert_eq!(Entry::NotFound.to_string(), "NA");
    }

    #[test]
    fn insert_persists_and_never_overwrites() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("cache.tsv");
        let found = Entry::Found(AlleleFrequencies::new([("A", 0.12), ("G", 0.88)]));
        let positional = VariantKey::Locus(Locus {
            chrom: "1".into(),
            pos: 1000,
            reference: None,
            alternative: None,
        });

        {
            let mut cache = Cache::open(&path)?;
            assert!(cache.insert(VariantKey::Rsid(123), found.clone())?);
            assert!(cache.insert(VariantKey::Rsid(5), Entry::NotFound)?);
            assert!(cache.insert(positional.clone(), Entry::NotFound)?);
            assert!(!cache.insert(VariantKey::Rsid(123), Entry::NotFound)?);
        }

        assert_eq!(
            std::fs::read_to_string(&path)?,
            "variant\tfrequencies\nrs123\tA=0.12,G=0.88\nrs5\tNA\n1:1000\tNA\n"
        );

        let mut cache = Cache::open(&path)?;
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&VariantKey::Rsid(123)), Some(&found));
        assert_eq!(cache.get(&positional), Some(&Entry::NotFound));
        assert!(!cache.insert(VariantKey::Rsid(5), found)?);
        assert_eq!(std::fs::read_to_string(&path)?.lines().count(), 4);

        Ok(())
    }

    #[tracing_test::traced_test]
    #[test]
    fn open_skips_malformed_lines() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("cache.tsv");
        std::fs::write(
            &path,
            "variant\tfrequencies\n\
             rs1\tA=0.5,G=0.5\n\
             rs1\tNA\n\
             garbage\n\
             rs2\tA=x\n\
             rs3\tNA\n",
        )?;

        let mut cache = Cache::open(&path)?;

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.get(&VariantKey::Rsid(1)).and_then(Entry::found),
            Some(&AlleleFrequencies::new([("A", 0.5), ("G", 0.5)]))
        );
        assert_eq!(cache.get(&VariantKey::Rsid(3)), Some(&Entry::NotFound));
        assert!(logs_contain("skipping malformed cache line"));

        assert!(cache.insert(VariantKey::Rsid(4), Entry::NotFound)?);

        Ok(())
    }

    #[tracing_test::traced_test]
    #[test]
    fn open_skips_interrupted_last_line() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("cache.tsv");
        std::fs::write(&path, "variant\tfrequencies\nrs2\tNA\nrs1\tA=0.12,G=0.8")?;

        let mut cache = Cache::open(&path)?;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&VariantKey::Rsid(1)), None);
        assert_eq!(cache.get(&VariantKey::Rsid(2)), Some(&Entry::NotFound));
        assert!(logs_contain("skipping interrupted last line"));

        // The interrupted line must not swallow the next entry.
        let found = Entry::Found(AlleleFrequencies::new([("A", 0.12), ("G", 0.88)]));
        assert!(cache.insert(VariantKey::Rsid(1), found.clone())?);
        drop(cache);
        assert_eq!(
            std::fs::read_to_string(&path)?,
            "variant\tfrequencies\nrs2\tNA\nrs1\tA=0.12,G=0.88\n"
        );
        let cache = Cache::load(&path)?;
        assert_eq!(cache.get(&VariantKey::Rsid(1)), Some(&found));

        Ok(())
    }

    #[test]
    fn load_skips_interrupted_last_line() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("cache.tsv");
        std::fs::write(&path, "variant\tfrequencies\nrs1\tA=0.12,G=0.8")?;

        let cache = Cache::load(&path)?;

        assert!(cache.is_empty());

        Ok(())
    }

    #[tracing_test::traced_test]
    #[test]
    fn load_missing_file() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;

        let mut cache = Cache::load(tmp_dir.path().join("missing.tsv"))?;
        assert!(cache.is_empty());
        assert!(cache.insert(VariantKey::Rsid(1), Entry::NotFound)?);
        assert!(!tmp_dir.path().join("missing.tsv").exists());

        Ok(())
    }
}
