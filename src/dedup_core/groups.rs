use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dedup_core::imagehash::hamming_distance;
use crate::dedup_core::index::CandidateRow;
use crate::dedup_core::media::MediaClass;
use crate::dedup_core::options::DetectOptions;
use crate::dedup_core::videofp::{self, VideoComparisonOptions, VideoVerdict};

/// A positive signal that connected two candidates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    ExactBytes,
    DhashClose { distance: u32 },
    VideoFrameMatch { verdict: VideoVerdict },
    DimensionsMatch,
    DurationMatch,
    CaptureTimeClose,
    FilenameSimilar,
}

impl Signal {
    /// Deterministic human-readable rationale line.
    pub fn describe(&self) -> String {
        match self {
            Signal::ExactBytes => "identical size and content hash".to_string(),
            Signal::DhashClose { distance } => {
                format!("image hashes within distance {distance}")
            }
            Signal::VideoFrameMatch { verdict } => match verdict {
                VideoVerdict::Duplicate => "video frames match".to_string(),
                _ => "video frames similar".to_string(),
            },
            Signal::DimensionsMatch => "identical pixel dimensions".to_string(),
            Signal::DurationMatch => "durations within tolerance".to_string(),
            Signal::CaptureTimeClose => "capture times within 2s".to_string(),
            Signal::FilenameSimilar => "near-identical filenames".to_string(),
        }
    }
}

/// A contradiction subtracting from (or forbidding) a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Penalty {
    MediaClassMismatch,
    AspectRatioDivergence,
    HugeSizeDelta,
}

/// Group lifecycle. Transitions are validated when recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Open,
    Complete,
    Planned,
    Abandoned,
    Merged,
    Undone,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Open => "open",
            GroupState::Complete => "complete",
            GroupState::Planned => "planned",
            GroupState::Abandoned => "abandoned",
            GroupState::Merged => "merged",
            GroupState::Undone => "undone",
        }
    }

    pub fn parse(s: &str) -> Option<GroupState> {
        match s {
            "open" => Some(GroupState::Open),
            "complete" => Some(GroupState::Complete),
            "planned" => Some(GroupState::Planned),
            "abandoned" => Some(GroupState::Abandoned),
            "merged" => Some(GroupState::Merged),
            "undone" => Some(GroupState::Undone),
            _ => None,
        }
    }

    pub fn can_transition(&self, next: GroupState) -> bool {
        matches!(
            (self, next),
            (GroupState::Open, GroupState::Complete)
                | (GroupState::Complete, GroupState::Planned)
                | (GroupState::Complete, GroupState::Abandoned)
                | (GroupState::Planned, GroupState::Merged)
                | (GroupState::Planned, GroupState::Abandoned)
                | (GroupState::Merged, GroupState::Undone)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMember {
    pub file_id: Uuid,
    pub confidence: f64,
    pub signals: Vec<Signal>,
    pub penalties: Vec<Penalty>,
    pub keeper_suggestion: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    /// Assigned by the index on save; 0 until then.
    pub id: i64,
    pub media_class: MediaClass,
    pub confidence: f64,
    pub rationale: Vec<String>,
    pub incomplete: bool,
    pub state: GroupState,
    pub members: Vec<GroupMember>,
}

/// Union-find with union-by-rank and path compression.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        UnionFind {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Result of scoring one candidate pair.
#[derive(Debug, Clone)]
struct PairEvaluation {
    signals: Vec<Signal>,
    penalties: Vec<Penalty>,
    score: f64,
    forbidden: bool,
}

/// Clusters candidate rows into duplicate groups. Bucketing bounds the
/// pairwise comparisons; union-find stitches qualifying pairs into
/// connected components.
pub struct GroupBuilder<'a> {
    options: &'a DetectOptions,
}

impl<'a> GroupBuilder<'a> {
    pub fn new(options: &'a DetectOptions) -> Self {
        GroupBuilder { options }
    }

    /// Candidates must arrive in a stable order (the index emits them
    /// sorted by path); everything downstream is deterministic.
    pub fn build(&self, candidates: &[CandidateRow]) -> Vec<DuplicateGroup> {
        let buckets = self.bucket(candidates);

        let mut uf = UnionFind::new(candidates.len());
        let mut edges: Vec<(usize, usize, PairEvaluation)> = Vec::new();
        let mut compared: HashSet<(usize, usize)> = HashSet::new();

        for indices in buckets.values() {
            for (pos, &i) in indices.iter().enumerate() {
                for &j in &indices[pos + 1..] {
                    if !compared.insert((i.min(j), i.max(j))) {
                        continue;
                    }
                    let eval = self.score_pair(&candidates[i], &candidates[j]);
                    if eval.forbidden {
                        continue;
                    }
                    if eval.score >= self.options.thresholds.confidence_similar {
                        uf.union(i, j);
                        edges.push((i.min(j), i.max(j), eval));
                    }
                }
            }
        }

        self.finalize(candidates, &mut uf, &edges)
    }

    /// Coarse bucketing. Photos with a dHash land in one bucket per hash
    /// byte: a pair within Hamming distance 7 differs in at most 7 bytes,
    /// so it always shares at least one bucket and close pairs are never
    /// separated. Unsigned photos band by orientation; videos by duration,
    /// landing in both adjacent bands near a band edge.
    fn bucket(&self, candidates: &[CandidateRow]) -> BTreeMap<String, Vec<usize>> {
        let mut buckets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, candidate) in candidates.iter().enumerate() {
            match candidate.class {
                MediaClass::Photo => match candidate.dhash {
                    Some(hash) => {
                        for (slot, byte) in hash.to_be_bytes().iter().enumerate() {
                            buckets
                                .entry(format!("photo|{slot}|{byte:02x}"))
                                .or_default()
                                .push(i);
                        }
                    }
                    None => {
                        let orientation = match (candidate.width, candidate.height) {
                            (Some(w), Some(h)) if w > h => "landscape",
                            (Some(w), Some(h)) if w < h => "portrait",
                            (Some(_), Some(_)) => "square",
                            _ => "unsized",
                        };
                        buckets
                            .entry(format!("photo|none|{orientation}"))
                            .or_default()
                            .push(i);
                    }
                },
                MediaClass::Video => {
                    let duration = candidate.duration_sec.unwrap_or(0.0).max(0.0);
                    let tolerance = self.options.thresholds.duration_tolerance_seconds;
                    let low = ((duration - tolerance).max(0.0) / 10.0) as u64;
                    let high = ((duration + tolerance) / 10.0) as u64;
                    for band in low..=high {
                        buckets
                            .entry(format!("video|{band:08}"))
                            .or_default()
                            .push(i);
                    }
                }
                // Audio is cataloged only, never grouped.
                MediaClass::Audio => {}
            }
        }
        buckets
    }

    fn score_pair(&self, a: &CandidateRow, b: &CandidateRow) -> PairEvaluation {
        let weights = &self.options.weights;
        let thresholds = &self.options.thresholds;
        let mut signals = Vec::new();
        let mut penalties = Vec::new();

        if a.class != b.class {
            return PairEvaluation {
                signals,
                penalties: vec![Penalty::MediaClassMismatch],
                score: 0.0,
                forbidden: true,
            };
        }

        let mut score = 0.0;

        if a.size == b.size {
            if let (Some(ha), Some(hb)) = (&a.content_hash, &b.content_hash) {
                if ha == hb {
                    signals.push(Signal::ExactBytes);
                    score += weights.exact_bytes;
                }
            }
        }

        if let (Some(ha), Some(hb)) = (a.dhash, b.dhash) {
            let distance = hamming_distance(ha, hb);
            if distance <= thresholds.image_distance {
                signals.push(Signal::DhashClose { distance });
                score += weights.dhash_duplicate;
            } else if distance <= thresholds.image_near_distance {
                signals.push(Signal::DhashClose { distance });
                score += weights.dhash_near;
            }
        }

        if let (Some(va), Some(vb)) = (&a.video, &b.video) {
            let verdict = videofp::compare_signatures(
                va,
                vb,
                &VideoComparisonOptions::from_options(self.options),
            );
            match verdict {
                VideoVerdict::Duplicate => {
                    signals.push(Signal::VideoFrameMatch { verdict });
                    score += weights.video_duplicate;
                }
                VideoVerdict::Similar => {
                    signals.push(Signal::VideoFrameMatch { verdict });
                    score += weights.video_similar;
                }
                VideoVerdict::Different | VideoVerdict::InsufficientData => {}
            }
        }

        if let (Some(wa), Some(ha), Some(wb), Some(hb)) = (a.width, a.height, b.width, b.height) {
            if wa == wb && ha == hb {
                signals.push(Signal::DimensionsMatch);
                score += weights.dimensions;
            }
        }

        if let (Some(da), Some(db)) = (a.duration_sec, b.duration_sec) {
            let tolerance = thresholds
                .duration_tolerance_seconds
                .max(thresholds.duration_tolerance_pct * da.min(db));
            if (da - db).abs() <= tolerance {
                signals.push(Signal::DurationMatch);
                score += weights.duration;
            }
        }

        if let (Some(ca), Some(cb)) = (a.capture_date, b.capture_date) {
            if (ca - cb).whole_seconds().abs() <= 2 {
                signals.push(Signal::CaptureTimeClose);
                score += weights.capture_time;
            }
        }

        if filename_similar(&a.file_name, &b.file_name) {
            signals.push(Signal::FilenameSimilar);
            score += weights.filename;
        }

        if let (Some(wa), Some(ha), Some(wb), Some(hb)) = (a.width, a.height, b.width, b.height) {
            if ha > 0 && hb > 0 {
                let aspect_a = wa as f64 / ha as f64;
                let aspect_b = wb as f64 / hb as f64;
                if (aspect_a - aspect_b).abs() > 0.05 {
                    penalties.push(Penalty::AspectRatioDivergence);
                    score -= weights.penalty_aspect_ratio;
                }
            }
        }

        let (small, large) = (a.size.min(b.size), a.size.max(b.size));
        if large > 0 && (small as f64 / large as f64) < 0.5 {
            penalties.push(Penalty::HugeSizeDelta);
            score -= weights.penalty_size_delta;
        }

        PairEvaluation {
            signals,
            penalties,
            score,
            forbidden: false,
        }
    }

    fn finalize(
        &self,
        candidates: &[CandidateRow],
        uf: &mut UnionFind,
        edges: &[(usize, usize, PairEvaluation)],
    ) -> Vec<DuplicateGroup> {
        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..candidates.len() {
            components.entry(uf.find(i)).or_default().push(i);
        }

        let mut groups = Vec::new();
        for (_, mut members) in components {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|&a, &b| candidates[a].path.cmp(&candidates[b].path));

            let mut incomplete = members.len() > self.options.limits.max_group_size;
            if incomplete {
                members.truncate(self.options.limits.max_group_size);
            }

            // The centroid is the member with the most within-group edges,
            // ties broken by path order.
            let mut edge_counts: BTreeMap<usize, usize> = BTreeMap::new();
            for (i, j, _) in edges {
                if members.contains(i) && members.contains(j) {
                    *edge_counts.entry(*i).or_default() += 1;
                    *edge_counts.entry(*j).or_default() += 1;
                }
            }
            let centroid = members
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    edge_counts
                        .get(&a)
                        .unwrap_or(&0)
                        .cmp(edge_counts.get(&b).unwrap_or(&0))
                        .then(candidates[b].path.cmp(&candidates[a].path))
                })
                .unwrap_or(members[0]);

            let mut group_members = Vec::with_capacity(members.len());
            let mut rationale: Vec<String> = Vec::new();
            let mut confidence_sum = 0.0;

            for &m in &members {
                let mut member_signals: Vec<Signal> = Vec::new();
                let mut member_penalties: Vec<Penalty> = Vec::new();
                let mut centroid_score: Option<f64> = None;
                let mut best_score: f64 = 0.0;

                for (i, j, eval) in edges {
                    if *i != m && *j != m {
                        continue;
                    }
                    let other = if *i == m { *j } else { *i };
                    if !members.contains(&other) {
                        continue;
                    }
                    member_signals.extend(eval.signals.iter().cloned());
                    member_penalties.extend(eval.penalties.iter().cloned());
                    best_score = best_score.max(eval.score);
                    if other == centroid {
                        centroid_score = Some(eval.score);
                    }
                }

                let confidence = clamp01(centroid_score.unwrap_or(best_score));
                confidence_sum += confidence;

                member_signals.sort_by_key(Signal::describe);
                member_signals.dedup();
                member_penalties.sort();
                member_penalties.dedup();

                for signal in &member_signals {
                    rationale.push(signal.describe());
                }
                if !candidates[m].has_expected_signature() {
                    incomplete = true;
                }

                group_members.push(GroupMember {
                    file_id: candidates[m].file_id,
                    confidence,
                    signals: member_signals,
                    penalties: member_penalties,
                    keeper_suggestion: false,
                });
            }

            // Provisional keeper suggestion from the raw candidate facts;
            // the planner makes the authoritative pick.
            if let Some(best) = members
                .iter()
                .enumerate()
                .max_by(|&(_, &a), &(_, &b)| {
                    let ca = &candidates[a];
                    let cb = &candidates[b];
                    ca.pixel_count()
                        .cmp(&cb.pixel_count())
                        .then(ca.size.cmp(&cb.size))
                        .then(cb.file_name.cmp(&ca.file_name))
                })
                .map(|(pos, _)| pos)
            {
                group_members[best].keeper_suggestion = true;
            }

            rationale.sort();
            rationale.dedup();

            let confidence = clamp01(confidence_sum / group_members.len() as f64);
            groups.push(DuplicateGroup {
                id: 0,
                media_class: candidates[members[0]].class,
                confidence,
                rationale,
                incomplete,
                state: GroupState::Open,
                members: group_members,
            });
        }
        groups
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Case-insensitive basename similarity: edit distance at most 2 after
/// stripping trailing counter suffixes like " (2)", "_1" or "-3".
fn filename_similar(a: &str, b: &str) -> bool {
    let a = normalized_stem(a);
    let b = normalized_stem(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    edit_distance(&a, &b) <= 2
}

fn normalized_stem(name: &str) -> String {
    let stem = std::path::Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    strip_counter_suffix(stem).to_lowercase()
}

/// Strip "name (3)" always, and "name_2"/"name-2" when the counter is one
/// or two digits (longer digit runs are serial numbers, not copy counters).
fn strip_counter_suffix(stem: &str) -> &str {
    if stem.ends_with(')') {
        if let Some(open) = stem.rfind(" (") {
            let inner = &stem[open + 2..stem.len() - 1];
            if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                return &stem[..open];
            }
        }
    }
    let digits = stem.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if (1..=2).contains(&digits) {
        let head = &stem[..stem.len() - digits];
        if let Some(stripped) = head.strip_suffix(['_', '-']) {
            return stripped;
        }
    }
    stem
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
