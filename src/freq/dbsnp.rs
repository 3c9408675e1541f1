//! Access to allele frequencies in dbSNP via NCBI E-utilities `efetch`.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde_with::{serde_as, DisplayFromStr};

use super::{cache::AlleleFrequencies, BuildPolicy, Config};
use crate::common::Assembly;

/// Problems with looking up frequencies.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The call did not finish within the configured timeout.
    #[error("dbSNP request timed out")]
    Timeout,
    /// The source does not know the requested variants.
    #[error("dbSNP has no record for the requested variants")]
    NotFound,
    /// The call failed for another reason.
    #[error("dbSNP request failed: {0}")]
    Request(String),
    /// The response could not be decoded.
    #[error("could not decode dbSNP response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LookupError::Timeout
        } else if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            LookupError::NotFound
        } else {
            LookupError::Request(e.to_string())
        }
    }
}

/// A source of allele frequencies for batches of rsIDs.
pub trait FrequencySource {
    /// Fetch the frequencies of `rsids`.
    ///
    /// rsIDs without usable frequency data are absent from the result.
    fn fetch(&mut self, rsids: &[u64]) -> Result<BTreeMap<u64, AlleleFrequencies>, LookupError>;
}

/// Blocking HTTP client for the efetch endpoint.
#[derive(Debug)]
pub struct Client {
    client: reqwest::blocking::Client,
    url: String,
    study: String,
    build_policy: BuildPolicy,
    assembly: Assembly,
}

impl Client {
    /// Create a new `Client`.
    ///
    /// # Errors
    ///
    /// If the underlying HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, anyhow::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("problem building HTTP client: {}", e))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            study: config.study.clone(),
            build_policy: config.build_policy,
            assembly: config.assembly,
        })
    }
}

impl FrequencySource for Client {
    fn fetch(&mut self, rsids: &[u64]) -> Result<BTreeMap<u64, AlleleFrequencies>, LookupError> {
        let ids = rsids.iter().join(",");
        tracing::debug!("querying dbSNP for {}", &ids);
        let text = self
            .client
            .get(&self.url)
            .query(&[
                ("db", "snp"),
                ("id", ids.as_str()),
                ("rettype", "json"),
                ("retmode", "text"),
            ])
            .send()?
            .error_for_status()?
            .text()?;

        parse_response(&text, &self.study, self.build_policy, self.assembly)
    }
}

/// One refSNP report as returned by efetch.
#[serde_as]
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RefSnp {
    /// The number of the rsID.
    #[serde_as(as = "DisplayFromStr")]
    pub refsnp_id: u64,
    /// Missing for withdrawn or merged refSNPs.
    pub primary_snapshot_data: Option<SnapshotData>,
}

/// The current placement and annotations of a refSNP.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SnapshotData {
    /// One entry per allele, in the order dbSNP lists them.
    #[serde(default)]
    pub allele_annotations: Vec<AlleleAnnotation>,
}

/// Annotations of one allele.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlleleAnnotation {
    /// Counts from all studies that report the allele.
    #[serde(default)]
    pub frequency: Vec<FrequencyEntry>,
}

/// Allele counts of one study.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FrequencyEntry {
    /// Name of the study, e.g., `dbGaP_PopFreq`.
    pub study_name: String,
    /// Number of observed copies of the allele.
    pub allele_count: u64,
    /// Number of observed alleles at the position.
    pub total_count: u64,
    /// What was observed, and where.
    pub observation: Observation,
}

/// The observed allele and its placement.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Observation {
    /// RefSeq accession, e.g., `NC_000001.11`.
    pub seq_id: String,
    /// The allele.
    pub inserted_sequence: String,
}

impl RefSnp {
    /// Extract the frequency per allele as reported by `study`.
    ///
    /// Per allele, the first observation accepted by `build_policy` is used.
    /// Zero frequencies are dropped.
    pub fn allele_frequencies(
        &self,
        study: &str,
        build_policy: BuildPolicy,
        assembly: Assembly,
    ) -> AlleleFrequencies {
        let mut result = AlleleFrequencies::default();
        let annotations = self
            .primary_snapshot_data
            .iter()
            .flat_map(|data| data.allele_annotations.iter());
        for annotation in annotations {
            let entry = annotation.frequency.iter().find(|entry| {
                entry.study_name == study
                    && match build_policy {
                        BuildPolicy::FirstReported => true,
                        BuildPolicy::MatchAssembly => {
                            assembly.has_accession(&entry.observation.seq_id)
                        }
                    }
            });
            if let Some(entry) = entry {
                if entry.total_count == 0 || entry.allele_count == 0 {
                    continue;
                }
                let frequency = entry.allele_count as f64 / entry.total_count as f64;
                result.insert_first(&entry.observation.inserted_sequence, frequency);
            }
        }

        result
    }
}

/// Parse an efetch response of concatenated refSNP JSON objects.
///
/// # Errors
///
/// `LookupError::Decode` if any object is malformed.
pub fn parse_response(
    text: &str,
    study: &str,
    build_policy: BuildPolicy,
    assembly: Assembly,
) -> Result<BTreeMap<u64, AlleleFrequencies>, LookupError> {
    let mut result = BTreeMap::new();
    for refsnp in serde_json::Deserializer::from_str(text).into_iter::<RefSnp>() {
        let refsnp = refsnp.map_err(|e| LookupError::Decode(e.to_string()))?;
        let frequencies = refsnp.allele_frequencies(study, build_policy, assembly);
        if frequencies.is_empty() {
            tracing::debug!("no {} frequencies for rs{}", study, refsnp.refsnp_id);
        } else {
            result.insert(refsnp.refsnp_id, frequencies);
        }
    }

    Ok(result)
}
