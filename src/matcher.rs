//! Template library and approximate gesture classification
//!
//! Patterns are compared with normalized Levenshtein similarity:
//! `1 - distance(a, b) / max(|a|, |b|)`.

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{Result, TelemetryError};
use crate::gesture::{parse_pattern, Gesture, MotionLabel};
use crate::sample::Axis;

/// A named reference gesture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureTemplate {
    pub name: String,
    pub gesture: Gesture,
}

#[derive(Serialize, Deserialize)]
struct LibraryFile {
    templates: Vec<GestureTemplate>,
}

/// Name → template map; changes only through explicit add and remove
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GestureLibrary {
    templates: BTreeMap<String, GestureTemplate>,
}

impl GestureLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library holding `shake-x`, `push`, `lift` and `circle`
    pub fn with_builtins() -> Self {
        const BUILTINS: [(&str, &str, Option<Axis>); 4] = [
            ("shake-x", "+X -X +X -X", None),
            ("push", "+Y -Y", Some(Axis::Z)),
            ("lift", "+Z -Z", None),
            ("circle", "+X +Y -X -Y", Some(Axis::Z)),
        ];

        let mut library = Self::new();
        for (name, pattern, inactive_axis) in BUILTINS {
            // Built-in patterns are static and well-formed
            let pattern = parse_pattern(pattern).unwrap_or_default();
            library.templates.insert(
                name.to_string(),
                GestureTemplate {
                    name: name.to_string(),
                    gesture: Gesture::from_pattern(pattern, inactive_axis),
                },
            );
        }
        library
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&GestureTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Templates in name order
    pub fn iter(&self) -> impl Iterator<Item = &GestureTemplate> {
        self.templates.values()
    }

    pub fn add_template(&mut self, name: &str, gesture: Gesture, overwrite: bool) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TelemetryError::InvalidConfig("template name must not be empty".to_string()));
        }
        if !overwrite && self.templates.contains_key(name) {
            return Err(TelemetryError::DuplicateTemplateName(name.to_string()));
        }
        log::info!("Adding template '{}' ({} labels)", name, gesture.pattern().len());
        self.templates
            .insert(name.to_string(), GestureTemplate { name: name.to_string(), gesture });
        Ok(())
    }

    pub fn remove_template(&mut self, name: &str) -> Result<GestureTemplate> {
        let name = name.trim();
        let removed = self
            .templates
            .remove(name)
            .ok_or_else(|| TelemetryError::UnknownTemplateName(name.to_string()))?;
        log::info!("Removed template '{}'", name);
        Ok(removed)
    }

    /// Load a JSON template file; duplicate names in the file are rejected
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let parsed: LibraryFile = serde_json::from_reader(BufReader::new(file))?;

        let mut library = Self::new();
        for template in parsed.templates {
            let name = template.name.clone();
            library.add_template(&name, template.gesture, false)?;
        }
        log::info!("Loaded {} templates from {}", library.len(), path.display());
        Ok(library)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let contents = LibraryFile { templates: self.templates.values().cloned().collect() };
        serde_json::to_writer_pretty(BufWriter::new(file), &contents)?;
        log::info!("Saved {} templates to {}", self.len(), path.display());
        Ok(())
    }
}

/// Outcome of classifying one gesture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Classification {
    Recognized { name: String, score: f64 },
    Unrecognized { best_score: f64 },
}

impl Classification {
    pub fn is_recognized(&self) -> bool {
        matches!(self, Classification::Recognized { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum similarity in [0, 1] for a match
    pub min_similarity: f64,
    /// Patterns are truncated to this many labels before comparison
    pub max_pattern_len: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self { min_similarity: 0.7, max_pattern_len: 64 }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(TelemetryError::InvalidConfig(format!(
                "min_similarity {} not in [0, 1]",
                self.min_similarity
            )));
        }
        if self.max_pattern_len == 0 {
            return Err(TelemetryError::InvalidConfig("max_pattern_len must be positive".to_string()));
        }
        Ok(())
    }
}

fn levenshtein(a: &[MotionLabel], b: &[MotionLabel]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, la) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, lb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(la != lb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Normalized similarity in [0, 1]; 0 when either pattern is empty
pub fn similarity(a: &[MotionLabel], b: &[MotionLabel]) -> f64 {
    let longest = a.len().max(b.len());
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

pub struct Matcher {
    config: MatcherConfig,
}

impl Matcher {
    pub fn new(config: MatcherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Best template at or above the threshold; ties go to the first name
    pub fn classify(&self, gesture: &Gesture, library: &GestureLibrary) -> Classification {
        let limit = self.config.max_pattern_len;
        let pattern = &gesture.pattern()[..gesture.pattern().len().min(limit)];
        if pattern.is_empty() {
            return Classification::Unrecognized { best_score: 0.0 };
        }

        let mut best: Option<(&str, f64)> = None;
        for template in library.iter() {
            let reference = template.gesture.pattern();
            let reference = &reference[..reference.len().min(limit)];
            let score = similarity(pattern, reference);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((template.name.as_str(), score));
            }
        }

        match best {
            Some((name, score)) if score >= self.config.min_similarity => {
                log::debug!("Classified as '{}' (score {:.2})", name, score);
                Classification::Recognized { name: name.to_string(), score }
            }
            Some((_, score)) => Classification::Unrecognized { best_score: score },
            None => Classification::Unrecognized { best_score: 0.0 },
        }
    }
}

struct Mailbox {
    pending: Option<Gesture>,
    stop: bool,
}

/// Background classifier with a single-slot mailbox
///
/// Submitting while a gesture is still pending replaces it.
pub struct MatchWorker {
    mailbox: Arc<(Mutex<Mailbox>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl MatchWorker {
    pub fn spawn<F>(matcher: Matcher, library: Arc<RwLock<GestureLibrary>>, mut on_result: F) -> Self
    where
        F: FnMut(Classification) + Send + 'static,
    {
        let mailbox = Arc::new((Mutex::new(Mailbox { pending: None, stop: false }), Condvar::new()));
        let worker_mailbox = Arc::clone(&mailbox);

        let thread = thread::spawn(move || {
            let (lock, ready) = &*worker_mailbox;
            loop {
                let gesture = {
                    let mut state = lock.lock();
                    while state.pending.is_none() && !state.stop {
                        ready.wait(&mut state);
                    }
                    if state.stop {
                        break;
                    }
                    state.pending.take()
                };
                if let Some(gesture) = gesture {
                    let result = matcher.classify(&gesture, &library.read());
                    on_result(result);
                }
            }
            log::debug!("Match worker stopped");
        });

        Self { mailbox, thread: Some(thread) }
    }

    pub fn submit(&self, gesture: Gesture) {
        let (lock, ready) = &*self.mailbox;
        let mut state = lock.lock();
        if state.pending.replace(gesture).is_some() {
            log::warn!("Match still pending; dropping older gesture");
        }
        ready.notify_one();
    }
}

impl Drop for MatchWorker {
    fn drop(&mut self) {
        {
            let (lock, ready) = &*self.mailbox;
            lock.lock().stop = true;
            ready.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
