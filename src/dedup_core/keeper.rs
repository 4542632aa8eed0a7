use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::dedup_core::error::{DedupError, Result};
use crate::dedup_core::metadata::MediaMetadata;

/// EXIF date format for planned writes.
const EXIF_DATE_FORMAT: &[time::format_description::FormatItem] =
    time::macros::format_description!("[year]:[month]:[day] [hour]:[minute]:[second]");

/// One group member with everything keeper selection and merge planning
/// need; a value copy, never a live index row.
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub file_id: Uuid,
    pub path: PathBuf,
    pub metadata: MediaMetadata,
}

/// Where a merged field value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FieldSource {
    Keep,
    Fill,
    MergeFrom { file_id: Uuid },
}

/// Audit entry for one field of the merge plan.
#[derive(Debug, Clone, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<String>,
    pub new: Option<String>,
    pub source: FieldSource,
}

/// Immutable description of what a merge will do. Dry runs return one of
/// these without touching the filesystem.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub group_id: i64,
    pub keeper_file_id: Uuid,
    pub keeper_path: PathBuf,
    pub keeper_metadata: MediaMetadata,
    pub merged_metadata: MediaMetadata,
    /// EXIF/IPTC keys to write, limited to newly added fields.
    pub exif_writes: BTreeMap<String, String>,
    pub trash_list: Vec<Uuid>,
    pub field_changes: Vec<FieldChange>,
}

impl MergePlan {
    /// Names of the fields the merge actually changes.
    pub fn merged_fields(&self) -> Vec<String> {
        self.field_changes
            .iter()
            .filter(|change| change.source != FieldSource::Keep)
            .map(|change| change.field.clone())
            .collect()
    }
}

/// Format preference for keeper selection: RAW beats PNG beats JPEG beats
/// HEIC; everything else scores zero.
fn format_preference(file_name: &str) -> f64 {
    let ext = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "raw" | "cr2" | "cr3" | "nef" | "nrw" | "arw" | "dng" | "orf" | "pef" | "rw2" | "sr2"
        | "x3f" | "erf" | "raf" | "dcr" | "kdc" | "mrw" | "mos" | "srw" | "fff" => 1.0,
        "png" => 0.9,
        "jpg" | "jpeg" => 0.7,
        "heic" | "heif" => 0.5,
        _ => 0.0,
    }
}

fn pixel_count(meta: &MediaMetadata) -> u64 {
    meta.width.unwrap_or(0) as u64 * meta.height.unwrap_or(0) as u64
}

/// Lexicographic keeper ordering; `Greater` means `a` wins. The chain ends
/// in path and id comparisons so the order is total and runs are
/// reproducible for any member set.
fn keeper_ordering(a: &MemberSnapshot, b: &MemberSnapshot) -> Ordering {
    pixel_count(&a.metadata)
        .cmp(&pixel_count(&b.metadata))
        .then_with(|| a.metadata.file_size.cmp(&b.metadata.file_size))
        .then_with(|| {
            format_preference(&a.metadata.file_name)
                .total_cmp(&format_preference(&b.metadata.file_name))
        })
        .then_with(|| {
            a.metadata
                .completeness_score()
                .total_cmp(&b.metadata.completeness_score())
        })
        .then_with(
            || match (a.metadata.capture_date, b.metadata.capture_date) {
                // Earlier capture wins; nulls last.
                (Some(ca), Some(cb)) => cb.cmp(&ca),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            },
        )
        .then_with(|| b.metadata.file_name.cmp(&a.metadata.file_name))
        .then_with(|| b.path.cmp(&a.path))
        .then_with(|| b.file_id.cmp(&a.file_id))
}

/// Pick the keeper for a member set. Deterministic: the same members yield
/// the same keeper regardless of input order.
pub fn select_keeper(members: &[MemberSnapshot]) -> Result<&MemberSnapshot> {
    members
        .iter()
        .max_by(|a, b| keeper_ordering(a, b))
        .ok_or_else(|| DedupError::Argument("cannot select a keeper from an empty group".into()))
}

/// Compute the merge plan for a group: keeper choice, field merge policy,
/// EXIF writes for newly added fields, and the trash list.
pub fn plan_merge(group_id: i64, members: &[MemberSnapshot]) -> Result<MergePlan> {
    if members.len() < 2 {
        return Err(DedupError::Argument(
            "merge planning needs at least two members".into(),
        ));
    }

    let keeper = select_keeper(members)?.clone();
    let mut losers: Vec<&MemberSnapshot> = members
        .iter()
        .filter(|m| m.file_id != keeper.file_id)
        .collect();
    losers.sort_by(|a, b| a.path.cmp(&b.path));

    let mut merged = keeper.metadata.clone();
    let mut field_changes = Vec::new();
    let mut exif_writes = BTreeMap::new();

    // captureDate: keep keeper's if set, else the earliest among sources.
    let capture_fill = losers
        .iter()
        .filter_map(|l| l.metadata.capture_date.map(|d| (d, l.file_id)))
        .min_by_key(|(d, _)| *d);
    match (keeper.metadata.capture_date, capture_fill) {
        (None, Some((date, _))) => {
            merged.capture_date = Some(date);
            exif_writes.insert(
                "DateTimeOriginal".to_string(),
                date.format(EXIF_DATE_FORMAT)
                    .map_err(|e| DedupError::InvalidDateFormat(e.to_string()))?,
            );
            field_changes.push(FieldChange {
                field: "captureDate".to_string(),
                old: None,
                new: Some(format_date(&date)),
                source: FieldSource::Fill,
            });
        }
        (old, _) => field_changes.push(FieldChange {
            field: "captureDate".to_string(),
            old: old.as_ref().map(format_date),
            new: old.as_ref().map(format_date),
            source: FieldSource::Keep,
        }),
    }

    // GPS: keep keeper's if set, else the first non-null source.
    let keeper_has_gps = keeper.metadata.gps_lat.is_some() && keeper.metadata.gps_lon.is_some();
    let gps_fill = losers
        .iter()
        .find_map(|l| match (l.metadata.gps_lat, l.metadata.gps_lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        });
    match (keeper_has_gps, gps_fill) {
        (false, Some((lat, lon))) => {
            merged.gps_lat = Some(lat);
            merged.gps_lon = Some(lon);
            exif_writes.insert("GPSLatitude".to_string(), format!("{}", lat.abs()));
            exif_writes.insert(
                "GPSLatitudeRef".to_string(),
                if lat < 0.0 { "S" } else { "N" }.to_string(),
            );
            exif_writes.insert("GPSLongitude".to_string(), format!("{}", lon.abs()));
            exif_writes.insert(
                "GPSLongitudeRef".to_string(),
                if lon < 0.0 { "W" } else { "E" }.to_string(),
            );
            field_changes.push(FieldChange {
                field: "gps".to_string(),
                old: None,
                new: Some(format!("{lat},{lon}")),
                source: FieldSource::Fill,
            });
        }
        _ => field_changes.push(FieldChange {
            field: "gps".to_string(),
            old: format_gps(&keeper.metadata),
            new: format_gps(&keeper.metadata),
            source: FieldSource::Keep,
        }),
    }

    // cameraModel: keep keeper's if set, else the first non-empty source.
    let keeper_camera = keeper
        .metadata
        .camera_model
        .as_deref()
        .filter(|m| !m.is_empty());
    let camera_fill = losers.iter().find_map(|l| {
        l.metadata
            .camera_model
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(|m| m.to_string())
    });
    match (keeper_camera, camera_fill) {
        (None, Some(model)) => {
            exif_writes.insert("Model".to_string(), model.clone());
            field_changes.push(FieldChange {
                field: "cameraModel".to_string(),
                old: None,
                new: Some(model.clone()),
                source: FieldSource::Fill,
            });
            merged.camera_model = Some(model);
        }
        (old, _) => field_changes.push(FieldChange {
            field: "cameraModel".to_string(),
            old: old.map(str::to_string),
            new: old.map(str::to_string),
            source: FieldSource::Keep,
        }),
    }

    // keywords/tags: union, unique-sorted.
    merge_terms(
        "keywords",
        &keeper.metadata.keywords,
        &losers,
        |l| &l.metadata.keywords,
        &mut merged.keywords,
        &mut field_changes,
        Some(("Keywords", &mut exif_writes)),
    );
    merge_terms(
        "tags",
        &keeper.metadata.tags,
        &losers,
        |l| &l.metadata.tags,
        &mut merged.tags,
        &mut field_changes,
        Some(("Subject", &mut exif_writes)),
    );

    Ok(MergePlan {
        group_id,
        keeper_file_id: keeper.file_id,
        keeper_path: keeper.path.clone(),
        keeper_metadata: keeper.metadata.clone(),
        merged_metadata: merged,
        exif_writes,
        trash_list: losers.iter().map(|l| l.file_id).collect(),
        field_changes,
    })
}

fn format_date(date: &OffsetDateTime) -> String {
    date.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

fn format_gps(meta: &MediaMetadata) -> Option<String> {
    match (meta.gps_lat, meta.gps_lon) {
        (Some(lat), Some(lon)) => Some(format!("{lat},{lon}")),
        _ => None,
    }
}

fn merge_terms<'a>(
    field: &str,
    keeper_terms: &[String],
    losers: &[&'a MemberSnapshot],
    get: impl Fn(&'a MemberSnapshot) -> &'a Vec<String>,
    merged_out: &mut Vec<String>,
    field_changes: &mut Vec<FieldChange>,
    exif_key: Option<(&str, &mut BTreeMap<String, String>)>,
) {
    let mut union: Vec<String> = keeper_terms.to_vec();
    let mut contributor: Option<Uuid> = None;
    for &loser in losers {
        for term in get(loser) {
            if !union.contains(term) {
                union.push(term.clone());
                contributor.get_or_insert(loser.file_id);
            }
        }
    }
    union.sort();
    union.dedup();

    match contributor {
        Some(file_id) => {
            field_changes.push(FieldChange {
                field: field.to_string(),
                old: Some(keeper_terms.join(",")),
                new: Some(union.join(",")),
                source: FieldSource::MergeFrom { file_id },
            });
            if let Some((key, writes)) = exif_key {
                writes.insert(key.to_string(), union.join(", "));
            }
            *merged_out = union;
        }
        None => {
            field_changes.push(FieldChange {
                field: field.to_string(),
                old: Some(keeper_terms.join(",")),
                new: Some(keeper_terms.join(",")),
                source: FieldSource::Keep,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup_core::media::MediaClass;

    fn member(name: &str, size: u64, dims: (u32, u32)) -> MemberSnapshot {
        MemberSnapshot {
            file_id: Uuid::new_v4(),
            path: PathBuf::from(format!("/photos/{name}")),
            metadata: MediaMetadata {
                file_name: name.to_string(),
                file_size: size,
                media_class: MediaClass::Photo,
                created_at: None,
                modified_at: None,
                capture_date: None,
                width: Some(dims.0),
                height: Some(dims.1),
                duration_sec: None,
                camera_model: None,
                gps_lat: None,
                gps_lon: None,
                keywords: Vec::new(),
                tags: Vec::new(),
                content_type: "image/jpeg".to_string(),
            },
        }
    }

    #[test]
    fn test_format_preference_order() {
        assert_eq!(format_preference("a.dng"), 1.0);
        assert_eq!(format_preference("a.CR3"), 1.0);
        assert_eq!(format_preference("a.png"), 0.9);
        assert_eq!(format_preference("a.jpeg"), 0.7);
        assert_eq!(format_preference("a.heic"), 0.5);
        assert_eq!(format_preference("a.gif"), 0.0);
    }

    #[test]
    fn test_keeper_exact_ties_fall_to_filename() {
        // All criteria tied: the lexicographically smaller filename wins.
        let a = member("a.jpg", 5000, (4000, 3000));
        let b = member("b.jpg", 5000, (4000, 3000));
        let members = [b.clone(), a.clone()];
        let keeper = select_keeper(&members).unwrap();
        assert_eq!(keeper.file_id, a.file_id);
    }

    #[test]
    fn test_keeper_resolution_wins() {
        let large = member("z-large.jpg", 1000, (4000, 3000));
        let small = member("a-small.jpg", 9000, (1000, 750));
        let members = [small, large.clone()];
        let keeper = select_keeper(&members).unwrap();
        assert_eq!(keeper.file_id, large.file_id);
    }

    #[test]
    fn test_keeper_format_preference_beats_nothing_else_tied() {
        // Same 24MP, same size, same capture date: the DNG wins over JPEG.
        let capture = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let mut dng = member("shot.dng", 30_000_000, (6000, 4000));
        let mut jpg = member("shot.jpg", 30_000_000, (6000, 4000));
        dng.metadata.capture_date = Some(capture);
        jpg.metadata.capture_date = Some(capture);
        let members = [jpg, dng.clone()];
        let keeper = select_keeper(&members).unwrap();
        assert_eq!(keeper.file_id, dng.file_id);
    }

    #[test]
    fn test_keeper_earliest_capture_nulls_last() {
        let early = OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap();
        let late = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let mut a = member("x.jpg", 100, (100, 100));
        let mut b = member("y.jpg", 100, (100, 100));
        a.metadata.capture_date = Some(late);
        b.metadata.capture_date = Some(early);
        // completeness now differs? both have only capture_date -> equal.
        let members = [a, b.clone()];
        let keeper = select_keeper(&members).unwrap();
        assert_eq!(keeper.file_id, b.file_id);

        let with_date = {
            let mut m = member("p.jpg", 100, (100, 100));
            m.metadata.capture_date = Some(late);
            m
        };
        let without_date = member("a.jpg", 100, (100, 100));
        // The dated member also scores higher on completeness, but both
        // rules agree here: nulls lose.
        let members = [without_date, with_date.clone()];
        let keeper = select_keeper(&members).unwrap();
        assert_eq!(keeper.file_id, with_date.file_id);
    }

    #[test]
    fn test_keeper_selection_is_order_independent() {
        let mut members = vec![
            member("c.jpg", 900, (2000, 1500)),
            member("a.jpg", 1000, (2000, 1500)),
            member("b.jpg", 1000, (2000, 1500)),
        ];
        let first = select_keeper(&members).unwrap().file_id;
        members.reverse();
        assert_eq!(select_keeper(&members).unwrap().file_id, first);
        members.swap(0, 1);
        assert_eq!(select_keeper(&members).unwrap().file_id, first);
    }

    #[test]
    fn test_plan_exact_copies_has_no_merged_fields() {
        let a = member("a.jpg", 5000, (4000, 3000));
        let b = member("b.jpg", 5000, (4000, 3000));
        let plan = plan_merge(1, &[a.clone(), b.clone()]).unwrap();
        assert_eq!(plan.keeper_file_id, a.file_id);
        assert_eq!(plan.trash_list, vec![b.file_id]);
        assert!(plan.merged_fields().is_empty());
        assert!(plan.exif_writes.is_empty());
        assert_eq!(plan.merged_metadata, plan.keeper_metadata);
    }

    #[test]
    fn test_plan_gps_fill_from_loser() {
        let keeper = member("a.jpg", 5000, (4000, 3000));
        let mut loser = member("b.jpg", 100, (400, 300));
        loser.metadata.gps_lat = Some(12.345678);
        loser.metadata.gps_lon = Some(-98.765432);

        let plan = plan_merge(1, &[keeper.clone(), loser]).unwrap();
        assert_eq!(plan.keeper_file_id, keeper.file_id);
        assert_eq!(plan.merged_metadata.gps_lat, Some(12.345678));
        assert_eq!(plan.merged_metadata.gps_lon, Some(-98.765432));
        let gps_change = plan
            .field_changes
            .iter()
            .find(|c| c.field == "gps")
            .unwrap();
        assert_eq!(gps_change.source, FieldSource::Fill);
        assert_eq!(plan.exif_writes.get("GPSLatitudeRef").unwrap(), "N");
        assert_eq!(plan.exif_writes.get("GPSLongitudeRef").unwrap(), "W");
        // The keeper snapshot stays untouched.
        assert_eq!(plan.keeper_metadata.gps_lat, None);
    }

    #[test]
    fn test_plan_capture_date_earliest_and_no_overwrite() {
        let early = OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap();
        let later = OffsetDateTime::from_unix_timestamp(1_650_000_000).unwrap();

        // Keeper has a capture date: it is kept even when a loser is earlier.
        let mut keeper = member("a.jpg", 9000, (4000, 3000));
        keeper.metadata.capture_date = Some(later);
        let mut loser = member("b.jpg", 100, (400, 300));
        loser.metadata.capture_date = Some(early);
        let plan = plan_merge(1, &[keeper.clone(), loser.clone()]).unwrap();
        assert_eq!(plan.merged_metadata.capture_date, Some(later));
        assert!(!plan.exif_writes.contains_key("DateTimeOriginal"));

        // Keeper without capture date gets the earliest source.
        let keeper = member("a.jpg", 9000, (4000, 3000));
        let mut other = member("c.jpg", 120, (400, 300));
        other.metadata.capture_date = Some(later);
        let plan = plan_merge(1, &[keeper, loser, other]).unwrap();
        assert_eq!(plan.merged_metadata.capture_date, Some(early));
        assert!(plan.exif_writes.contains_key("DateTimeOriginal"));
    }

    #[test]
    fn test_plan_keyword_union_merge_from() {
        let mut keeper = member("a.jpg", 9000, (4000, 3000));
        keeper.metadata.keywords = vec!["beach".to_string()];
        let mut loser = member("b.jpg", 100, (400, 300));
        loser.metadata.keywords = vec!["sunset".to_string(), "beach".to_string()];

        let plan = plan_merge(1, &[keeper, loser.clone()]).unwrap();
        assert_eq!(plan.merged_metadata.keywords, vec!["beach", "sunset"]);
        let change = plan
            .field_changes
            .iter()
            .find(|c| c.field == "keywords")
            .unwrap();
        assert_eq!(
            change.source,
            FieldSource::MergeFrom {
                file_id: loser.file_id
            }
        );
        assert_eq!(plan.exif_writes.get("Keywords").unwrap(), "beach, sunset");
        assert!(plan.merged_fields().contains(&"keywords".to_string()));
    }

    #[test]
    fn test_plan_rejects_degenerate_groups() {
        let only = member("a.jpg", 100, (100, 100));
        assert!(plan_merge(1, &[only]).is_err());
        assert!(select_keeper(&[]).is_err());
    }
}
