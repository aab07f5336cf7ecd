// src/clustering/fingerprint.rs
//
// In-process n-gram fingerprint binning, mirroring the keyer and bin
// ordering of the OpenRefine clusterer so either backend can serve a run.

use anyhow::anyhow;
use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};

use super::Clusterer;
use crate::artifact::{read_artifact, WorkingArtifact};
use crate::errors::ClusteringError;
use crate::models::{ClusterGroup, ClusterMember};

// ASCII punctuation, control characters and whitespace.
static STRIP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\p{Cc}\s!-/:-@\[-`{-~]").expect("valid fingerprint regex")
});

/// Folds Latin diacritics to their ASCII base letter.
fn fold_char(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => 'g',
        'ĥ' | 'ħ' => 'h',
        'ì' | 'í' | 'î' | 'ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => 'i',
        'ĵ' => 'j',
        'ķ' => 'k',
        'ĺ' | 'ļ' | 'ľ' | 'ŀ' | 'ł' => 'l',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ŏ' | 'ő' => 'o',
        'ŕ' | 'ŗ' | 'ř' => 'r',
        'ś' | 'ŝ' | 'ş' | 'š' => 's',
        'ţ' | 'ť' | 'ŧ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
        'ŵ' => 'w',
        'ý' | 'ÿ' | 'ŷ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        'º' => 'o',
        'ª' => 'a',
        other => other,
    }
}

/// N-gram fingerprint key: lower-case, fold diacritics, strip
/// punctuation/control/whitespace, then concatenate the sorted set of
/// distinct n-grams.
///
/// With `ngram_size == 1` two strings share a key when they use the same
/// characters regardless of order.
pub fn ngram_fingerprint(value: &str, ngram_size: usize) -> String {
    let n = ngram_size.max(1);
    let lowered: String = value.to_lowercase().chars().map(fold_char).collect();
    let stripped: Vec<char> = STRIP_RE.replace_all(&lowered, "").chars().collect();

    let grams: BTreeSet<String> = if stripped.len() < n {
        // Shorter than one gram: the whole string is its only gram.
        std::iter::once(stripped.iter().collect::<String>()).collect()
    } else {
        stripped
            .windows(n)
            .map(|w| w.iter().collect::<String>())
            .collect()
    };

    grams.into_iter().collect()
}

/// Bins `values` by fingerprint and returns the bins with at least two
/// distinct values. Bins are ordered by distinct-value count (desc); members
/// by occurrence count (desc) then value.
pub fn bin_values<'a, I>(values: I, ngram_size: usize) -> Vec<ClusterGroup>
where
    I: IntoIterator<Item = &'a str>,
{
    // key -> (first-seen order, value -> count)
    let mut bins: HashMap<String, (usize, HashMap<&'a str, u64>)> = HashMap::new();
    for value in values {
        let key = ngram_fingerprint(value, ngram_size);
        let next_order = bins.len();
        let bin = bins.entry(key).or_insert_with(|| (next_order, HashMap::new()));
        *bin.1.entry(value).or_insert(0) += 1;
    }

    let mut clustered: Vec<(usize, Vec<ClusterMember>)> = bins
        .into_values()
        .filter(|(_, counts)| counts.len() > 1)
        .map(|(order, counts)| {
            let mut members: Vec<ClusterMember> = counts
                .into_iter()
                .map(|(value, count)| ClusterMember::new(value, count))
                .collect();
            members.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
            (order, members)
        })
        .collect();

    clustered.sort_by(|(order_a, a), (order_b, b)| {
        b.len().cmp(&a.len()).then_with(|| order_a.cmp(order_b))
    });

    clustered
        .into_iter()
        .map(|(_, members)| ClusterGroup::new(members))
        .collect()
}

/// Clusterer that never leaves the process.
#[derive(Debug, Clone)]
pub struct LocalFingerprintClusterer {
    ngram_size: usize,
}

impl LocalFingerprintClusterer {
    pub fn new(ngram_size: usize) -> Self {
        Self {
            ngram_size: ngram_size.max(1),
        }
    }
}

impl Default for LocalFingerprintClusterer {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl Clusterer for LocalFingerprintClusterer {
    async fn cluster(
        &self,
        artifact: &WorkingArtifact,
        column_name: &str,
    ) -> Result<Vec<ClusterGroup>, ClusteringError> {
        // Reading the artifact back stands in for project creation.
        let (header, rows) = read_artifact(artifact.path()).map_err(|e| ClusteringError::ProjectCreation {
            artifact: artifact.file_name().to_string(),
            cause: e,
        })?;

        if header != column_name {
            return Err(ClusteringError::Compute {
                artifact: artifact.file_name().to_string(),
                cause: anyhow!("column '{}' not found (header is '{}')", column_name, header),
            });
        }

        let groups = bin_values(rows.iter().map(String::as_str), self.ngram_size);
        debug!(
            "Local fingerprint binning of {} produced {} groups from {} rows",
            artifact.file_name(),
            groups.len(),
            rows.len()
        );
        Ok(groups)
    }

    fn name(&self) -> &'static str {
        "local-fingerprint"
    }
}
