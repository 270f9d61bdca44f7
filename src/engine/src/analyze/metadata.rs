//! Image configuration metadata analyzer.
//!
//! The analysis is the stable [`ConfigSummary`] projection. The diff is
//! field-wise: keyed fields (env by variable name, labels by key)
//! produce only-1 / only-2 / changed groups; plain sets (ports, volumes)
//! produce the asymmetric groups; scalar fields produce a single changed
//! entry.

use std::collections::BTreeMap;

use serde::Serialize;
use shale_core::error::Result;

use super::Analyzer;
use crate::image::{ConfigSummary, Image};
use crate::report::{AnalyzeResult, DiffResult, Report};

/// All field diffs with any difference, in a fixed field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataDiff(pub Vec<FieldDiff>);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldDiff {
    #[serde(rename = "Field")]
    pub field: String,
    #[serde(rename = "Image1Only")]
    pub image1_only: Vec<String>,
    #[serde(rename = "Image2Only")]
    pub image2_only: Vec<String>,
    #[serde(rename = "Changed")]
    pub changed: Vec<ValueChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChange {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Image1")]
    pub value1: String,
    #[serde(rename = "Image2")]
    pub value2: String,
}

impl MetadataDiff {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FieldDiff {
    fn named(field: &str) -> Self {
        Self {
            field: field.to_string(),
            ..Default::default()
        }
    }

    fn has_differences(&self) -> bool {
        !self.image1_only.is_empty() || !self.image2_only.is_empty() || !self.changed.is_empty()
    }
}

/// Field-wise configuration diff.
pub fn metadata_diff(config1: &ConfigSummary, config2: &ConfigSummary) -> MetadataDiff {
    let mut fields = Vec::new();

    fields.push(keyed_field_diff(
        "Env",
        &keyed_entries(&config1.env),
        &keyed_entries(&config2.env),
    ));
    fields.push(scalar_field_diff(
        "Entrypoint",
        &config1.entrypoint.join(" "),
        &config2.entrypoint.join(" "),
    ));
    fields.push(scalar_field_diff(
        "Cmd",
        &config1.cmd.join(" "),
        &config2.cmd.join(" "),
    ));
    fields.push(scalar_field_diff(
        "WorkingDir",
        &config1.working_dir,
        &config2.working_dir,
    ));
    fields.push(set_field_diff(
        "ExposedPorts",
        &config1.exposed_ports,
        &config2.exposed_ports,
    ));
    fields.push(set_field_diff("Volumes", &config1.volumes, &config2.volumes));
    fields.push(keyed_field_diff("Labels", &config1.labels, &config2.labels));

    MetadataDiff(fields.into_iter().filter(FieldDiff::has_differences).collect())
}

/// `KEY=VALUE` entries keyed by KEY.
fn keyed_entries(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}

fn keyed_field_diff(
    field: &str,
    map1: &BTreeMap<String, String>,
    map2: &BTreeMap<String, String>,
) -> FieldDiff {
    let mut diff = FieldDiff::named(field);
    for (key, value1) in map1 {
        match map2.get(key) {
            None => diff.image1_only.push(render_entry(key, value1)),
            Some(value2) if value1 != value2 => diff.changed.push(ValueChange {
                name: key.clone(),
                value1: value1.clone(),
                value2: value2.clone(),
            }),
            Some(_) => {}
        }
    }
    for (key, value2) in map2 {
        if !map1.contains_key(key) {
            diff.image2_only.push(render_entry(key, value2));
        }
    }
    diff
}

fn render_entry(key: &str, value: &str) -> String {
    if value.is_empty() {
        key.to_string()
    } else {
        format!("{}={}", key, value)
    }
}

fn set_field_diff(field: &str, set1: &[String], set2: &[String]) -> FieldDiff {
    let mut diff = FieldDiff::named(field);
    diff.image1_only = set1
        .iter()
        .filter(|v| !set2.contains(v))
        .cloned()
        .collect();
    diff.image2_only = set2
        .iter()
        .filter(|v| !set1.contains(v))
        .cloned()
        .collect();
    diff
}

fn scalar_field_diff(field: &str, value1: &str, value2: &str) -> FieldDiff {
    let mut diff = FieldDiff::named(field);
    if value1 != value2 {
        diff.changed.push(ValueChange {
            name: field.to_string(),
            value1: value1.to_string(),
            value2: value2.to_string(),
        });
    }
    diff
}

pub struct MetadataAnalyzer;

impl Analyzer for MetadataAnalyzer {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn analyze(&self, image: &Image) -> Result<AnalyzeResult> {
        Ok(AnalyzeResult::new(
            self.name(),
            &image.source,
            Report::Metadata(image.config.clone()),
        ))
    }

    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult> {
        Ok(DiffResult::new(
            self.name(),
            &image1.source,
            &image2.source,
            Report::MetadataDiff(metadata_diff(&image1.config, &image2.config)),
        ))
    }
}
