//! Row decoding and column lists for the SQL backend.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::any::AnyRow;

use lodestar_core::Error;
use lodestar_core::format::{Encoder, Format};
use lodestar_core::models::{
    ActualLrp, ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo, DesiredLrp,
    DesiredLrpKey, DesiredLrpRunInfo, DesiredLrpSchedulingInfo, ModificationTag, Resources,
    Routes, Task, VolumePlacement,
};

use crate::Result;

/// Scheduling info columns of `desired_lrps`.
pub const SCHEDULING_INFO_COLUMNS: &[&str] = &[
    "process_guid",
    "domain",
    "log_guid",
    "annotation",
    "instances",
    "memory_mb",
    "disk_mb",
    "max_pids",
    "rootfs",
    "routes",
    "volume_placement",
    "placement_tags",
    "modification_tag_epoch",
    "modification_tag_index",
];

/// Columns of `actual_lrps`.
pub const ACTUAL_LRP_COLUMNS: &[&str] = &[
    "process_guid",
    "instance_index",
    "evacuating",
    "domain",
    "state",
    "instance_guid",
    "cell_id",
    "placement_error",
    "since",
    "net_info",
    "modification_tag_epoch",
    "modification_tag_index",
    "crash_count",
    "crash_reason",
    "expire_time",
];

/// Columns of `tasks`.
pub const TASK_COLUMNS: &[&str] = &[
    "guid",
    "domain",
    "updated_at",
    "created_at",
    "first_completed_at",
    "state",
    "cell_id",
    "result",
    "failed",
    "failure_reason",
    "task_definition",
];

/// Renders a column list, optionally qualified by a table alias.
///
/// Qualified columns are aliased back to their bare names so row decoding
/// does not depend on the query shape.
#[must_use]
pub fn column_list(columns: &[&str], alias: Option<&str>) -> String {
    columns
        .iter()
        .map(|column| match alias {
            Some(alias) => format!("{alias}.{column} AS {column}"),
            None => (*column).to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders `n` comma-separated placeholders.
#[must_use]
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Converts an instant to stored nanoseconds.
#[must_use]
pub fn to_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt()
        .unwrap_or(if t.timestamp() < 0 { i64::MIN } else { i64::MAX })
}

/// Converts stored nanoseconds to an instant.
#[must_use]
pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

/// Converts a flag to its stored integer.
#[must_use]
pub const fn flag(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

pub(crate) fn text(row: &AnyRow, column: &str) -> Result<String> {
    row.try_get::<String, _>(column)
        .map_err(|e| Error::invalid_record(format!("column {column}: {e}")))
}

pub(crate) fn int(row: &AnyRow, column: &str) -> Result<i64> {
    row.try_get::<i64, _>(column)
        .map_err(|e| Error::invalid_record(format!("column {column}: {e}")))
}

pub(crate) fn u32_col(row: &AnyRow, column: &str) -> Result<u32> {
    u32::try_from(int(row, column)?)
        .map_err(|_| Error::invalid_record(format!("column {column} is out of range")))
}

pub(crate) fn i32_col(row: &AnyRow, column: &str) -> Result<i32> {
    i32::try_from(int(row, column)?)
        .map_err(|_| Error::invalid_record(format!("column {column} is out of range")))
}

fn tag(row: &AnyRow) -> Result<ModificationTag> {
    Ok(ModificationTag {
        epoch: text(row, "modification_tag_epoch")?,
        index: u32_col(row, "modification_tag_index")?,
    })
}

/// Seals the JSON form of `value` for a blob column.
///
/// # Errors
///
/// Returns an error if serialization or encryption fails.
pub fn seal<T: serde::Serialize>(encoder: &Encoder, value: &T) -> Result<String> {
    encoder.encode_json(Format::Base64Encrypted, value)
}

/// Decodes a scheduling info row.
///
/// # Errors
///
/// Returns [`Error::InvalidRecord`] if a column is missing or undecodable.
pub fn scheduling_info(row: &AnyRow, encoder: &Encoder) -> Result<DesiredLrpSchedulingInfo> {
    let routes: Routes = encoder.decode_json(&text(row, "routes")?)?;
    let volume_placement: VolumePlacement =
        encoder.decode_json(&text(row, "volume_placement")?)?;
    let placement_tags: Vec<String> = serde_json::from_str(&text(row, "placement_tags")?)?;
    Ok(DesiredLrpSchedulingInfo {
        key: DesiredLrpKey {
            process_guid: text(row, "process_guid")?,
            domain: text(row, "domain")?,
            log_guid: text(row, "log_guid")?,
        },
        instances: u32_col(row, "instances")?,
        annotation: text(row, "annotation")?,
        resources: Resources {
            memory_mb: i32_col(row, "memory_mb")?,
            disk_mb: i32_col(row, "disk_mb")?,
            max_pids: i32_col(row, "max_pids")?,
            rootfs: text(row, "rootfs")?,
        },
        routes,
        placement_tags,
        volume_placement,
        modification_tag: tag(row)?,
    })
}

/// Decodes a full desired LRP row, including `run_info`.
///
/// # Errors
///
/// Returns [`Error::InvalidRecord`] if a column is missing or undecodable.
pub fn desired_lrp(row: &AnyRow, encoder: &Encoder) -> Result<DesiredLrp> {
    let info = scheduling_info(row, encoder)?;
    let run_info: DesiredLrpRunInfo = encoder.decode_json(&text(row, "run_info")?)?;
    Ok(DesiredLrp::from_parts(info, run_info))
}

/// Decodes an actual LRP row.
///
/// An empty `net_info` column decodes to empty net info.
///
/// # Errors
///
/// Returns [`Error::InvalidRecord`] if a column is missing or undecodable.
pub fn actual_lrp(row: &AnyRow, encoder: &Encoder) -> Result<ActualLrp> {
    let net_payload = encoder.decode(&text(row, "net_info")?)?;
    let net_info = if net_payload.is_empty() {
        ActualLrpNetInfo::default()
    } else {
        serde_json::from_slice(&net_payload)?
    };
    let expire_time = int(row, "expire_time")?;
    Ok(ActualLrp {
        key: ActualLrpKey {
            process_guid: text(row, "process_guid")?,
            index: u32_col(row, "instance_index")?,
            domain: text(row, "domain")?,
        },
        instance_key: ActualLrpInstanceKey {
            instance_guid: text(row, "instance_guid")?,
            cell_id: text(row, "cell_id")?,
        },
        net_info,
        state: text(row, "state")?.parse()?,
        placement_error: text(row, "placement_error")?,
        since: from_nanos(int(row, "since")?),
        crash_count: u32_col(row, "crash_count")?,
        crash_reason: text(row, "crash_reason")?,
        modification_tag: tag(row)?,
        evacuating: int(row, "evacuating")? != 0,
        expires_at: (expire_time > 0).then(|| from_nanos(expire_time)),
    })
}

/// Decodes a task row.
///
/// # Errors
///
/// Returns [`Error::InvalidRecord`] if a column is missing or undecodable.
pub fn task(row: &AnyRow, encoder: &Encoder) -> Result<Task> {
    let first_completed_at = int(row, "first_completed_at")?;
    Ok(Task {
        guid: text(row, "guid")?,
        domain: text(row, "domain")?,
        state: text(row, "state")?.parse()?,
        cell_id: text(row, "cell_id")?,
        result: text(row, "result")?,
        failed: int(row, "failed")? != 0,
        failure_reason: text(row, "failure_reason")?,
        created_at: from_nanos(int(row, "created_at")?),
        updated_at: from_nanos(int(row, "updated_at")?),
        first_completed_at: (first_completed_at > 0).then(|| from_nanos(first_completed_at)),
        definition: encoder.decode_json(&text(row, "task_definition")?)?,
    })
}

/// Parses a comma-separated index aggregation.
///
/// # Errors
///
/// Returns [`Error::InvalidRecord`] if an entry is not an index.
pub fn parse_indices(aggregated: Option<&str>) -> Result<Vec<u32>> {
    aggregated
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| Error::invalid_record(format!("invalid instance index {s:?}")))
        })
        .collect()
}
