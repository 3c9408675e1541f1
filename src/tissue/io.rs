//! Reading of per-tissue significant variant files.

use std::path::Path;

use crate::common::open_read;

/// One line of a tissue file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Variant token, e.g., `chr1_1000_A_G_b38`.
    pub variant: String,
    /// Gene identifier, if the file has one.
    pub gene_id: Option<String>,
}

/// Tissue name from a file name, e.g., `Brain_Cortex` for
/// `Brain_Cortex.v8.signif_variant_gene_pairs.txt.gz`.
pub fn tissue_from_path(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .map(str::trim)
        .filter(|tissue| !tissue.is_empty())
        .map(str::to_string)
}

/// Load a tab-separated tissue file, optionally gzip-compressed.
///
/// If the first line contains `variant_id`, it is a GTEx header and the
/// `variant_id` and `gene_id` columns are used.  Otherwise, every line is
/// `variant[<TAB>gene]`.
///
/// # Errors
///
/// If anything goes wrong, it returns a generic `anyhow::Error`.
pub fn load_file<P>(path: P) -> Result<Vec<Record>, anyhow::Error>
where
    P: AsRef<Path>,
{
    tracing::debug!("opening file: {:?}", path.as_ref());
    let reader = open_read(path.as_ref())?;
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut variant_col = 0;
    let mut gene_col = Some(1);
    let mut result = Vec::new();
    for (i, record) in csv_reader.byte_records().enumerate() {
        let record = record.map_err(|e| anyhow::anyhow!("problem parsing record: {}", e))?;
        // Invalid bytes end up in the variant token, which then fails to normalize.
        let record = csv::StringRecord::from_byte_record_lossy(record);
        if i == 0 && record.iter().any(|column| column == "variant_id") {
            variant_col = record
                .iter()
                .position(|column| column == "variant_id")
                .unwrap_or_default();
            gene_col = record.iter().position(|column| column == "gene_id");
            continue;
        }

        let Some(variant) = record
            .get(variant_col)
            .map(str::trim)
            .filter(|v| !v.is_empty())
        else {
            continue;
        };
        result.push(Record {
            variant: variant.to_string(),
            gene_id: gene_col
                .and_then(|idx| record.get(idx))
                .map(str::trim)
                .filter(|gene| !gene.is_empty())
                .map(str::to_string),
        });
    }
    tracing::debug!("read a total of {} records", result.len());

    Ok(result)
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::Record;

    #[rstest::rstest]
    #[case("Brain_Cortex.v8.signif_variant_gene_pairs.txt.gz", Some("Brain_Cortex"))]
    #[case("dir/Whole_Blood.txt", Some("Whole_Blood"))]
    #[case("Liver", Some("Liver"))]
    #[case(".hidden", None)]
    fn tissue_from_path(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            super::tissue_from_path(Path::new(path)).as_deref(),
            expected
        );
    }

    #[test]
    fn load_file_with_header() -> Result<(), anyhow::Error> {
        let records =
            super::load_file("tests/data/tissue/Brain_Cortex.v8.signif_variant_gene_pairs.txt")?;

        assert_eq!(records.len(), 4);
        assert_eq!(
            records[0],
            Record {
                variant: "chr1_1000_A_G_b38".into(),
                gene_id: Some("ENSG00000001.5".into()),
            }
        );

        Ok(())
    }

    #[test]
    fn load_file_invalid_utf8_row() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("Liver.txt");
        let mut content = b"chr1_1000_A_G_b38\tENSG1\nchr1_2000_".to_vec();
        content.push(0xe9);
        content.extend_from_slice(b"\tENSG2\nchr2_3000_G_A_b38\tENSG3\n");
        std::fs::write(&path, content)?;

        let records = super::load_file(&path)?;

        assert_eq!(records.len(), 3);
        assert_eq!(records[1].variant, "chr1_2000_\u{fffd}");
        assert_eq!(records[2].gene_id.as_deref(), Some("ENSG3"));

        Ok(())
    }

    #[test]
    fn load_file_variants_only() -> Result<(), anyhow::Error> {
        let records = super::load_file("tests/data/tissue/Whole_Blood.v8.variants.txt.gz")?;

        assert_eq!(
            records,
            vec![
                Record {
                    variant: "chr1_1000_A_G_b38".into(),
                    gene_id: None,
                },
                Record {
                    variant: "chr2_3000_G_A_b38".into(),
                    gene_id: None,
                },
            ]
        );

        Ok(())
    }
}
