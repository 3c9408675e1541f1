//! Mapping from variant positions to dbSNP rsIDs.
//!
//! The table is the GTEx variant lookup table (or any TSV with a
//! `variant_id` column and an rsID column).

use std::path::Path;

use super::{Locus, Token, VariantKey};
use crate::common::open_read;

/// One row of the lookup table.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Record {
    /// Variant identifier, e.g., `chr1_1000_A_G_b38`.
    pub variant_id: String,
    /// The rsID, or `.` if there is none.
    #[serde(
        alias = "rs_id_dbSNP151_GRCh38p7",
        alias = "rs_id_dbSNP150_GRCh37p13",
        alias = "rs_id"
    )]
    pub rsid: String,
}

/// Load lookup table file.
///
/// # Arguments
///
/// * `path` - Path to the tab-separated lookup table, optionally gzip-compressed.
///
/// # Returns
///
/// Lookup table records.
///
/// # Errors
///
/// If anything goes wrong, it returns a generic `anyhow::Error`.
pub fn load_file<P>(path: P) -> Result<Vec<Record>, anyhow::Error>
where
    P: AsRef<Path>,
{
    tracing::debug!("opening file: {:?}", path.as_ref());
    let reader = open_read(path)?;

    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = csv_reader
        .byte_headers()
        .map_err(|e| anyhow::anyhow!("problem reading header: {}", e))?
        .clone();
    let mut result = Vec::new();
    let mut skipped = 0usize;
    for record in csv_reader.byte_records() {
        let record = record.map_err(|e| anyhow::anyhow!("problem parsing record: {}", e))?;
        match record.deserialize::<Record>(Some(&headers)) {
            Ok(record) => result.push(record),
            Err(e) => {
                tracing::debug!("skipping lookup row: {}", e);
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        tracing::warn!("skipped {} unreadable lookup rows", skipped);
    }
    tracing::debug!("read a total of {} records", result.len());

    Ok(result)
}

/// Facade struct for mapping positions to rsIDs.
#[derive(Debug, Clone, Default)]
pub struct Data {
    /// Mapping from locus with alleles to rsID.
    exact: rustc_hash::FxHashMap<Locus, u64>,
    /// Mapping from locus without alleles to rsID; `None` if ambiguous.
    by_position: rustc_hash::FxHashMap<Locus, Option<u64>>,
}

impl Data {
    /// Load from file and construct.
    pub fn load<P>(path: P) -> Result<Self, anyhow::Error>
    where
        P: AsRef<Path>,
    {
        let records = load_file(path)?;
        Ok(Self::new(records))
    }

    /// Create a new `Data` object.
    ///
    /// Rows without rsID or with unparsable `variant_id` are skipped.
    pub fn new(records: Vec<Record>) -> Self {
        let mut result = Self::default();
        let mut skipped = 0usize;
        for record in records {
            let key = Token::parse(&record.variant_id).map(|token| token.key);
            let rsid = record.rsid.parse::<VariantKey>().ok().and_then(|k| k.rsid());
            match (key, rsid) {
                (Ok(VariantKey::Locus(locus)), Some(rsid)) => result.insert(locus, rsid),
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::debug!("skipped {} lookup rows without usable rsID/variant", skipped);
        }

        result
    }

    fn insert(&mut self, locus: Locus, rsid: u64) {
        self.by_position
            .entry(locus.without_alleles())
            .and_modify(|current| {
                if *current != Some(rsid) {
                    *current = None;
                }
            })
            .or_insert(Some(rsid));
        if locus.reference.is_some() {
            self.exact.entry(locus).or_insert(rsid);
        }
    }

    /// Number of distinct positions in the table.
    pub fn len(&self) -> usize {
        self.by_position.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_position.is_empty()
    }

    /// Obtain the rsID for the given locus.
    ///
    /// Exact allele matches win; otherwise the position alone is used if it
    /// maps to a single rsID.
    pub fn rsid_for(&self, locus: &Locus) -> Option<u64> {
        self.exact
            .get(locus)
            .copied()
            .or_else(|| {
                self.by_position
                    .get(&locus.without_alleles())
                    .copied()
                    .flatten()
            })
    }
}

#[cfg(test)]
mod test {
    use super::super::Locus;

    fn locus(chrom: &str, pos: u64, alleles: Option<(&str, &str)>) -> Locus {
        Locus {
            chrom: chrom.to_string(),
            pos,
            reference: alleles.map(|(r, _)| r.to_string()),
            alternative: alleles.map(|(_, a)| a.to_string()),
        }
    }

    #[test]
    fn test_load_file() -> Result<(), anyhow::Error> {
        let records = super::load_file("tests/data/variant/lookup_table.txt")?;

        assert_eq!(records.len(), 5);
        assert_eq!(records[0].variant_id, "chr1_1000_A_G_b38");
        assert_eq!(records[0].rsid, "rs123");

        Ok(())
    }

    #[tracing_test::traced_test]
    #[test]
    fn load_file_skips_unreadable_row() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("lookup_table.txt");
        let mut content = b"variant_id\trs_id_dbSNP151_GRCh38p7\n\
            chr1_1000_A_G_b38\trs123\n\
            chr1_2000_C_T_b38\trs"
            .to_vec();
        content.push(0xe9);
        content.extend_from_slice(b"\nchr2_3000_G_A_b38\trs789\n");
        std::fs::write(&path, content)?;

        let records = super::load_file(&path)?;

        assert_eq!(
            records.iter().map(|r| r.rsid.as_str()).collect::<Vec<_>>(),
            vec!["rs123", "rs789"]
        );
        assert!(logs_contain("skipped 1 unreadable lookup rows"));

        Ok(())
    }

    #[test]
    fn data_load() -> Result<(), anyhow::Error> {
        let data = super::Data::load("tests/data/variant/lookup_table.txt")?;

        // The row with rsID "." is dropped.
        assert_eq!(data.len(), 3);
        assert_eq!(
            data.rsid_for(&locus("1", 1000, Some(("A", "G")))),
            Some(123)
        );
        assert_eq!(data.rsid_for(&locus("1", 1000, None)), Some(123));
        assert_eq!(data.rsid_for(&locus("X", 4000, None)), Some(1001780));
        assert_eq!(data.rsid_for(&locus("2", 3000, Some(("G", "A")))), None);

        Ok(())
    }

    #[test]
    fn data_ambiguous_position() -> Result<(), anyhow::Error> {
        let data = super::Data::load("tests/data/variant/lookup_table.txt")?;

        assert_eq!(
            data.rsid_for(&locus("1", 2000, Some(("C", "T")))),
            Some(456)
        );
        assert_eq!(
            data.rsid_for(&locus("1", 2000, Some(("C", "A")))),
            Some(789)
        );
        assert_eq!(data.rsid_for(&locus("1", 2000, None)), None);

        Ok(())
    }
}
