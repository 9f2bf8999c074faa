// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Metric points, values and capture filters

use crate::error::{Result, StatsError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Context key every posted value must carry
pub const BUILDER_NAME: &str = "builder_name";

/// Tag-like metadata accompanying a metric value
pub type Context = BTreeMap<String, String>;

/// Opaque scalar value of a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    /// Parse a value given on the command line, preferring the narrowest type
    pub fn parse(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            MetricValue::Bool(b)
        } else if let Ok(i) = raw.parse::<i64>() {
            MetricValue::Int(i)
        } else if let Some(f) = raw.parse::<f64>().ok().filter(|f| f.is_finite()) {
            MetricValue::Float(f)
        } else {
            MetricValue::Text(raw.to_string())
        }
    }

    /// False for NaN and infinite floats, which JSON and line protocol cannot hold
    pub fn is_finite(&self) -> bool {
        match self {
            MetricValue::Float(f) => f.is_finite(),
            _ => true,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Bool(b) => write!(f, "{}", b),
            MetricValue::Int(i) => write!(f, "{}", i),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Int(v.into())
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::Int(v.into())
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// A single value posted to the stats service.
///
/// Construction checks that the context carries [`BUILDER_NAME`], so every
/// point handed to a backend has a builder.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    name: String,
    value: MetricValue,
    context: Context,
    series_name: Option<String>,
    timestamp: DateTime<Utc>,
}

impl MetricPoint {
    pub fn new(name: impl Into<String>, value: impl Into<MetricValue>, context: Context) -> Result<Self> {
        if !context.contains_key(BUILDER_NAME) {
            return Err(StatsError::MissingContext { key: BUILDER_NAME });
        }

        Ok(Self {
            name: name.into(),
            value: value.into(),
            context,
            series_name: None,
            timestamp: Utc::now(),
        })
    }

    /// Store under an explicit series instead of `<builder_name>-<name>`
    pub fn with_series(mut self, series_name: impl Into<String>) -> Self {
        self.series_name = Some(series_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &MetricValue {
        &self.value
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn builder_name(&self) -> &str {
        // Presence is checked in `new`
        self.context
            .get(BUILDER_NAME)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn series_name(&self) -> String {
        match &self.series_name {
            Some(series) => series.clone(),
            None => format!("{}-{}", self.builder_name(), self.name),
        }
    }
}

/// Declares one metric a backend persists
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Capture {
    pub builder_name: String,
    pub property_name: String,
    #[serde(default)]
    pub extra_tags: HashMap<String, String>,
}

impl Capture {
    pub fn new(builder_name: impl Into<String>, property_name: impl Into<String>) -> Self {
        Self {
            builder_name: builder_name.into(),
            property_name: property_name.into(),
            extra_tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_tags.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, builder_name: &str, name: &str) -> bool {
        self.builder_name == builder_name && self.property_name == name
    }
}

/// Capture filter of a backend. Empty means "persist everything".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Captures(Vec<Capture>);

/// Outcome of filtering a point through a backend's captures
#[derive(Debug, PartialEq)]
pub enum CaptureMatch<'a> {
    /// No filter configured
    Unfiltered,
    Matched(&'a Capture),
    Rejected,
}

impl Captures {
    pub fn new(captures: Vec<Capture>) -> Self {
        Self(captures)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capture> {
        self.0.iter()
    }

    pub fn find(&self, builder_name: &str, name: &str) -> Option<&Capture> {
        self.0.iter().find(|c| c.matches(builder_name, name))
    }

    pub fn check(&self, point: &MetricPoint) -> CaptureMatch<'_> {
        if self.0.is_empty() {
            return CaptureMatch::Unfiltered;
        }
        match self.find(point.builder_name(), point.name()) {
            Some(capture) => CaptureMatch::Matched(capture),
            None => CaptureMatch::Rejected,
        }
    }
}

impl From<Vec<Capture>> for Captures {
    fn from(captures: Vec<Capture>) -> Self {
        Self(captures)
    }
}

/// Build a context holding only the builder name
pub fn builder_context(builder_name: &str) -> Context {
    let mut context = Context::new();
    context.insert(BUILDER_NAME.to_string(), builder_name.to_string());
    context
}
