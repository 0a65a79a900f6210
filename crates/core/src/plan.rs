use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Days, NaiveDate};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::config::DAM_ROOT;
use crate::{Error, Result};

/// One row of the customer structure: how many assets go into a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSpec {
    pub aem_path: String,
    pub asset_count: u32,
}

impl FolderSpec {
    pub fn new(aem_path: impl Into<String>, asset_count: i64) -> Result<Self> {
        let aem_path = aem_path.into().trim().to_string();
        if aem_path.is_empty() {
            return Err(Error::invalid_spec("folder path must not be blank"));
        }
        if asset_count < 0 {
            return Err(Error::invalid_spec(format!(
                "asset count for {aem_path} must be >= 0 (got {asset_count})"
            )));
        }
        let asset_count = u32::try_from(asset_count).map_err(|_| {
            Error::invalid_spec(format!("asset count for {aem_path} is too large"))
        })?;
        Ok(Self {
            aem_path,
            asset_count,
        })
    }
}

/// `YYYY/MM` partition computed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRoot {
    year: i32,
    month: u32,
}

impl DateRoot {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn segments(&self) -> [String; 2] {
        [format!("{:04}", self.year), format!("{:02}", self.month)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetShape {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub title: String,
    pub captured_on: NaiveDate,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    /// Run-scoped sequence number, also embedded in `file_name`.
    pub seq: u64,
    pub destination_folder: String,
    pub file_name: String,
    pub shape: AssetShape,
    pub metadata: AssetMetadata,
    /// Written only by the worker that owns the task.
    pub attempt_count: u32,
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub root: String,
    pub plan_date: NaiveDate,
    pub date_partition: bool,
    pub shape: AssetShape,
    pub max_tasks: Option<u64>,
}

const MIN_TAGS: usize = 5;
const MAX_TAGS: usize = 10;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusky", "eager", "faded", "gentle", "hollow", "icy", "jagged",
    "lucid", "misty", "nimble", "opal", "quiet", "rustic", "silver", "tidal", "vivid", "windy",
];

const NOUNS: &[&str] = &[
    "harbor", "meadow", "canyon", "glacier", "orchard", "lagoon", "summit", "prairie", "delta",
    "grove", "ridge", "valley", "island", "forest", "dune", "marsh", "cliff", "river", "tundra",
    "reef",
];

const TAG_WORDS: &[&str] = &[
    "landscape", "portrait", "travel", "nature", "urban", "sunset", "archive", "campaign",
    "product", "studio", "outdoor", "seasonal", "texture", "abstract", "aerial", "lifestyle",
];

/// Expands folder specs into the ordered task list for one run.
///
/// Every task of a folder shares one destination; the date root (if any) is
/// taken from `options.plan_date` and never re-evaluated.
pub fn build_plan(
    specs: &[FolderSpec],
    options: &PlanOptions,
    rng: &mut impl Rng,
) -> Result<Vec<UploadTask>> {
    let date_root = options
        .date_partition
        .then(|| DateRoot::from_date(options.plan_date));

    let mut seen = HashSet::new();
    let mut destinations = Vec::with_capacity(specs.len());
    for spec in specs {
        if spec.aem_path.trim().is_empty() {
            return Err(Error::invalid_spec("folder path must not be blank"));
        }
        if !seen.insert(spec.aem_path.trim()) {
            return Err(Error::invalid_spec(format!(
                "duplicate folder path: {}",
                spec.aem_path
            )));
        }
        destinations.push(resolve_destination(
            &options.root,
            date_root.as_ref(),
            &spec.aem_path,
        )?);
    }

    let total: u64 = specs.iter().map(|s| u64::from(s.asset_count)).sum();
    let limit = options.max_tasks.map_or(total, |cap| cap.min(total));

    let mut tasks = Vec::with_capacity(limit as usize);
    let mut seq = 0u64;
    'specs: for (spec, destination) in specs.iter().zip(destinations) {
        for _ in 0..spec.asset_count {
            if seq >= limit {
                break 'specs;
            }
            seq += 1;
            let metadata = random_metadata(options.plan_date, rng);
            let file_name = format!("{}_{seq:06}.jpg", normalize_file_stem(&metadata.title));
            tasks.push(UploadTask {
                seq,
                destination_folder: destination.clone(),
                file_name,
                shape: options.shape,
                metadata,
                attempt_count: 0,
            });
        }
    }

    Ok(tasks)
}

/// Task count per destination folder, in folder order.
pub fn folder_counts(tasks: &[UploadTask]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for task in tasks {
        *counts.entry(task.destination_folder.clone()).or_insert(0) += 1;
    }
    counts
}

/// `base [/ YYYY / MM] / relative`, where `relative` is `aem_path` made
/// relative to `root` when it lives under it, or to the DAM root when it is
/// some other absolute DAM path.
pub fn resolve_destination(root: &str, date_root: Option<&DateRoot>, aem_path: &str) -> Result<String> {
    let path = aem_path.trim();
    if path.is_empty() {
        return Err(Error::invalid_spec("folder path must not be blank"));
    }
    let root = root.trim_end_matches('/');

    let (base, relative) = if let Some(rest) = strip_path_prefix(path, root) {
        (root, rest)
    } else if let Some(rest) = strip_path_prefix(path, DAM_ROOT) {
        (DAM_ROOT, rest)
    } else {
        (root, path)
    };

    let mut segments: Vec<String> = base
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(date_root) = date_root {
        segments.extend(date_root.segments());
    }
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(Error::invalid_spec(format!(
                "folder path must not contain relative segments: {aem_path}"
            )));
        }
        segments.push(segment.to_string());
    }

    Ok(format!("/{}", segments.join("/")))
}

fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// ASCII-only, lowercase, spaces to underscores, everything else dropped.
pub fn normalize_file_stem(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii)
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn random_metadata(plan_date: NaiveDate, rng: &mut impl Rng) -> AssetMetadata {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("plain");
    let noun = NOUNS.choose(rng).copied().unwrap_or("asset");
    let title = format!("{} {}", capitalize(adjective), capitalize(noun));

    let start = NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or(plan_date);
    let span = (plan_date - start).num_days().max(0) as u64;
    let captured_on = start
        .checked_add_days(Days::new(rng.random_range(0..=span)))
        .unwrap_or(plan_date);

    let target = rng.random_range(MIN_TAGS..=MAX_TAGS);
    let mut tags = vec!["findme".to_string()];
    for word in [adjective, noun] {
        if word.len() >= 3 && !tags.iter().any(|t| t == word) {
            tags.push(word.to_string());
        }
    }
    let mut pool: Vec<&str> = TAG_WORDS.to_vec();
    while tags.len() < target && !pool.is_empty() {
        let idx = rng.random_range(0..pool.len());
        tags.push(pool.swap_remove(idx).to_string());
    }
    tags.truncate(MAX_TAGS);

    AssetMetadata {
        title,
        captured_on,
        tags,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
