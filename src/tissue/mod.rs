//! Index from variants to the tissues and genes they are significant for.

pub mod io;

use std::{collections::BTreeSet, fmt, ops::AddAssign, path::Path, str::FromStr};

use crate::common::list_files;
use crate::variant::{Normalizer, VariantKey};

/// A tissue and, if known, the gene a variant is associated with there.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TissueGene {
    /// Tissue name, e.g., `Brain_Cortex`.
    pub tissue: String,
    /// Gene identifier, e.g., `ENSG00000001.5`.
    pub gene_id: Option<String>,
}

impl fmt::Display for TissueGene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.gene_id {
            Some(gene_id) => write!(f, "{}:{}", self.tissue, gene_id),
            None => write!(f, "{}", self.tissue),
        }
    }
}

impl FromStr for TissueGene {
    type Err = anyhow::Error;

    /// Parse `tissue:gene` or `tissue`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tissue, gene_id) = match s.split_once(':') {
            Some((tissue, gene_id)) => (tissue, Some(gene_id.to_string())),
            None => (s, None),
        };
        if tissue.is_empty() || gene_id.as_deref() == Some("") {
            anyhow::bail!("invalid tissue association {:?}", s);
        }
        Ok(Self {
            tissue: tissue.to_string(),
            gene_id,
        })
    }
}

/// Counts of what happened while building the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IngestStats {
    /// Tissue files ingested.
    pub files: usize,
    /// Lines read.
    pub rows_read: usize,
    /// New (variant, tissue, gene) entries.
    pub pairs_added: usize,
    /// Lines skipped because their variant could not be normalized.
    pub unparsable_variant: usize,
}

impl AddAssign for IngestStats {
    fn add_assign(&mut self, rhs: Self) {
        self.files += rhs.files;
        self.rows_read += rhs.rows_read;
        self.pairs_added += rhs.pairs_added;
        self.unparsable_variant += rhs.unparsable_variant;
    }
}

/// Mapping from variant key to its tissue associations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: rustc_hash::FxHashMap<VariantKey, BTreeSet<TissueGene>>,
}

impl Index {
    /// Load every regular file in `dir`, one file per tissue.
    ///
    /// Files that fail to load are logged and skipped.
    ///
    /// # Returns
    ///
    /// The index, the ingest counts, and the number of failed files.
    ///
    /// # Errors
    ///
    /// If the directory cannot be listed.
    pub fn load_dir<P>(
        dir: P,
        normalizer: &Normalizer,
    ) -> Result<(Self, IngestStats, usize), anyhow::Error>
    where
        P: AsRef<Path>,
    {
        let mut index = Self::default();
        let mut total = IngestStats::default();
        let mut failed = 0;
        for path in list_files(dir)? {
            match index.ingest_file(&path, normalizer) {
                Ok(stats) => total += stats,
                Err(e) => {
                    tracing::error!("failed to ingest {}: {}", path.display(), e);
                    failed += 1;
                }
            }
        }
        tracing::info!(
            "tissue index has {} variants from {} files: {:?}",
            index.len(),
            total.files,
            &total
        );

        Ok((index, total, failed))
    }

    /// Add the associations of one tissue file.
    ///
    /// Ingesting a file again adds nothing.
    ///
    /// # Errors
    ///
    /// If no tissue name can be derived from the file name or the file cannot be read.
    pub fn ingest_file<P>(
        &mut self,
        path: P,
        normalizer: &Normalizer,
    ) -> Result<IngestStats, anyhow::Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let tissue = io::tissue_from_path(path)
            .ok_or_else(|| anyhow::anyhow!("no tissue name in {}", path.display()))?;
        let records = io::load_file(path)?;

        let mut stats = IngestStats {
            files: 1,
            ..Default::default()
        };
        for record in records {
            stats.rows_read += 1;
            match normalizer.normalize(&record.variant) {
                Ok(key) => {
                    let association = TissueGene {
                        tissue: tissue.clone(),
                        gene_id: record.gene_id,
                    };
                    if self.insert(key, association) {
                        stats.pairs_added += 1;
                    }
                }
                Err(e) => {
                    tracing::debug!("skipping {} line: {}", &tissue, e);
                    stats.unparsable_variant += 1;
                }
            }
        }
        if stats.unparsable_variant > 0 {
            tracing::warn!(
                "{}: skipped {} unparsable variants",
                path.display(),
                stats.unparsable_variant
            );
        }

        Ok(stats)
    }

    /// Add one association; returns whether it was new.
    pub fn insert(&mut self, key: VariantKey, association: TissueGene) -> bool {
        self.entries.entry(key).or_default().insert(association)
    }

    /// The associations of `key`, if any.
    pub fn get(&self, key: &VariantKey) -> Option<&BTreeSet<TissueGene>> {
        self.entries.get(key)
    }

    /// Number of variants in the index.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no variants.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
