//! Document Parser Stage (C3): format detection, extraction, structural/metadata analysis.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use tracing::instrument;

use crate::error::{ExtractError, PipelineError};
use crate::extract::{ExtractedDoc, ExtractorRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordInfo {
    pub keyword: String,
    pub frequency: usize,
    pub importance: f64,
    pub positions: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordCluster {
    pub name: String,
    pub members: Vec<String>,
    pub coherence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContentSummary {
    pub abstract_text: String,
    pub function_count: usize,
    pub api_count: usize,
    pub db_change_count: usize,
    pub mq_count: usize,
    pub timer_count: usize,
    pub function_names: Vec<String>,
    pub api_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataTags {
    pub user_roles: Vec<String>,
    pub target_audience: Vec<String>,
}

/// C3's `StageResult`: everything downstream stages and the assembled result need from a
/// parsed document. `extracted_text`/`section_offsets` are also what the Content Analyzer
/// chunks along section boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentParseResult {
    pub file_type: String,
    pub extracted_text: String,
    pub section_offsets: Vec<usize>,
    pub char_count: usize,
    pub word_count: usize,
    pub line_count: usize,
    pub headings: Vec<String>,
    pub table_count: usize,
    pub image_count: usize,
    pub keywords: Vec<KeywordInfo>,
    pub clusters: Vec<KeywordCluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentParseStageResult {
    pub parse: DocumentParseResult,
    pub content_summary: ContentSummary,
    pub metadata_tags: MetadataTags,
}

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "the", "a", "an", "and", "or", "of", "to", "in", "is", "are", "for", "on", "with", "this",
        "that", "it", "as", "be", "by", "at",
    ]
    .into_iter()
    .collect()
});

static API_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?i)\b(GET|POST|PUT|DELETE|PATCH)\s+/[\w/{}]+").unwrap());
static FUNCTION_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?m)^\s*(?:fn|function|def)\s+(\w+)").unwrap());

pub struct DocumentParserStage {
    extractors: ExtractorRegistry,
}

impl Default for DocumentParserStage {
    fn default() -> Self {
        Self {
            extractors: ExtractorRegistry::default(),
        }
    }
}

impl DocumentParserStage {
    /// Progress milestones: 10% extractor chosen, 40% text extracted, 75% structure+stats,
    /// 100% keywords+clusters.
    #[instrument(skip(self, on_progress))]
    pub fn run(
        &self,
        storage_path: &Path,
        file_name: &str,
        mut on_progress: impl FnMut(u8),
    ) -> Result<DocumentParseStageResult, PipelineError> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        on_progress(10);

        let doc = self
            .extractors
            .extract(storage_path, file_name)
            .map_err(|e| match e {
                ExtractError::Corrupt(msg) => PipelineError::ParseFailed(msg),
                other => PipelineError::from(other),
            })?;
        on_progress(40);

        let section_offsets: Vec<usize> = doc.headings.iter().map(|h| h.offset).collect();
        let headings: Vec<String> = doc.headings.iter().map(|h| h.text.clone()).collect();
        on_progress(75);

        let keywords = Self::extract_keywords(&doc);
        let clusters = Self::cluster_keywords(&keywords);
        let content_summary = Self::summarize_content(&doc);
        let metadata_tags = Self::tag_metadata(&doc);
        on_progress(100);

        Ok(DocumentParseStageResult {
            parse: DocumentParseResult {
                file_type: extension,
                extracted_text: doc.raw_text,
                section_offsets,
                char_count: doc.char_count,
                word_count: doc.word_count,
                line_count: doc.line_count,
                headings,
                table_count: doc.tables.len(),
                image_count: doc.images.len(),
                keywords,
                clusters,
            },
            content_summary,
            metadata_tags,
        })
    }

    /// Frequency-weighted salience with light stop-word filtering: importance is term
    /// frequency normalized by the most frequent term, which keeps it in [0,1] as required.
    fn extract_keywords(doc: &ExtractedDoc) -> Vec<KeywordInfo> {
        let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
        let mut offset = 0usize;
        for word in doc.raw_text.split_whitespace() {
            let normalized: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if normalized.len() > 2 && !STOPWORDS.contains(normalized.as_str()) {
                positions.entry(normalized).or_default().push(offset);
            }
            offset += word.len() + 1;
        }

        let max_freq = positions.values().map(Vec::len).max().unwrap_or(1).max(1);
        let mut keywords: Vec<KeywordInfo> = positions
            .into_iter()
            .map(|(keyword, positions)| {
                let frequency = positions.len();
                KeywordInfo {
                    keyword,
                    frequency,
                    importance: frequency as f64 / max_freq as f64,
                    positions,
                }
            })
            .collect();
        keywords.sort_by(|a, b| b.frequency.cmp(&a.frequency).then(a.keyword.cmp(&b.keyword)));
        keywords.truncate(50);
        keywords
    }

    /// Deterministic feature-hashed trigram vector stands in for a learned embedding: keeps
    /// clustering dependency-free and reproducible, at the cost of weaker semantic grouping.
    fn trigram_vector(word: &str, dims: usize) -> Vec<f64> {
        let mut vector = vec![0.0; dims];
        let chars: Vec<char> = word.chars().collect();
        if chars.len() < 3 {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::hash::Hash::hash(&word, &mut hasher);
            vector[(std::hash::Hasher::finish(&hasher) as usize) % dims] += 1.0;
            return vector;
        }
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::hash::Hash::hash(&trigram, &mut hasher);
            vector[(std::hash::Hasher::finish(&hasher) as usize) % dims] += 1.0;
        }
        vector
    }

    fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
        let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
        let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }

    /// Clusters keywords by cosine similarity of their hashed-trigram vectors over a fixed
    /// threshold; the label is the centroid-nearest keyword.
    fn cluster_keywords(keywords: &[KeywordInfo]) -> Vec<KeywordCluster> {
        const DIMS: usize = 32;
        const THRESHOLD: f64 = 0.3;

        let vectors: Vec<Vec<f64>> = keywords
            .iter()
            .map(|k| Self::trigram_vector(&k.keyword, DIMS))
            .collect();

        let mut assigned = vec![false; keywords.len()];
        let mut clusters = Vec::new();

        for i in 0..keywords.len() {
            if assigned[i] {
                continue;
            }
            let mut members = vec![i];
            assigned[i] = true;
            for j in (i + 1)..keywords.len() {
                if assigned[j] {
                    continue;
                }
                if Self::cosine_similarity(&vectors[i], &vectors[j]) >= THRESHOLD {
                    members.push(j);
                    assigned[j] = true;
                }
            }
            if members.len() < 2 {
                continue;
            }

            let mut centroid = vec![0.0; DIMS];
            for &idx in &members {
                for d in 0..DIMS {
                    centroid[d] += vectors[idx][d] / members.len() as f64;
                }
            }
            let label_idx = *members
                .iter()
                .max_by(|&&a, &&b| {
                    Self::cosine_similarity(&vectors[a], &centroid)
                        .partial_cmp(&Self::cosine_similarity(&vectors[b], &centroid))
                        .unwrap()
                })
                .unwrap();
            let coherence = members
                .iter()
                .map(|&idx| Self::cosine_similarity(&vectors[idx], &centroid))
                .sum::<f64>()
                / members.len() as f64;

            clusters.push(KeywordCluster {
                name: keywords[label_idx].keyword.clone(),
                members: members.iter().map(|&idx| keywords[idx].keyword.clone()).collect(),
                coherence,
            });
        }
        clusters
    }

    fn summarize_content(doc: &ExtractedDoc) -> ContentSummary {
        let function_names: Vec<String> = FUNCTION_RE
            .captures_iter(&doc.raw_text)
            .map(|c| c.get(1).unwrap().as_str().to_string())
            .collect();
        let api_names: Vec<String> = API_RE
            .find_iter(&doc.raw_text)
            .map(|m| m.as_str().to_string())
            .collect();
        let lowercase = doc.raw_text.to_lowercase();

        ContentSummary {
            abstract_text: doc.raw_text.chars().take(280).collect(),
            function_count: function_names.len(),
            api_count: api_names.len(),
            db_change_count: lowercase.matches("alter table").count()
                + lowercase.matches("create table").count(),
            mq_count: lowercase.matches("queue").count() + lowercase.matches("topic").count(),
            timer_count: lowercase.matches("cron").count() + lowercase.matches("scheduled").count(),
            function_names,
            api_names,
        }
    }

    fn tag_metadata(doc: &ExtractedDoc) -> MetadataTags {
        let lowercase = doc.raw_text.to_lowercase();
        let roles = ["admin", "user", "guest", "operator"];
        let user_roles = roles
            .into_iter()
            .filter(|r| lowercase.contains(r))
            .map(String::from)
            .collect();
        MetadataTags {
            user_roles,
            target_audience: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn zero_extractable_text_completes_without_crashing() {
        let stage = DocumentParserStage::default();
        let file = tempfile::NamedTempFile::with_suffix(".txt").unwrap();
        let mut progress = Vec::new();
        let result = stage
            .run(file.path(), "empty.txt", |p| progress.push(p))
            .unwrap();
        assert_eq!(result.parse.char_count, 0);
        assert!(result.parse.headings.is_empty());
        assert_eq!(progress, vec![10, 40, 75, 100]);
    }

    #[test]
    fn keyword_extraction_filters_stopwords() {
        let stage = DocumentParserStage::default();
        let mut file = tempfile::NamedTempFile::with_suffix(".md").unwrap();
        writeln!(file, "# Title\nThe authentication service authenticates users with the authentication token.").unwrap();
        let result = stage.run(file.path(), "doc.md", |_| {}).unwrap();
        assert!(result.parse.keywords.iter().all(|k| k.keyword != "the"));
        assert!(result.parse.keywords.iter().any(|k| k.keyword == "authentication"));
    }

    #[test]
    fn unsupported_format_fails_with_validation_error() {
        let stage = DocumentParserStage::default();
        let file = tempfile::NamedTempFile::with_suffix(".zip").unwrap();
        let err = stage.run(file.path(), "archive.zip", |_| {}).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
