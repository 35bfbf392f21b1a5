//! SensorThings API entity models and the payload builders for trial plots.

use crate::api::ThingKey;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

pub const OM_MEASUREMENT: &str =
    "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_Measurement";
const GEOJSON_ENCODING: &str = "application/geo+json";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Server-assigned `@iot.id`; numeric on most servers, string on some
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IotId {
    Number(i64),
    Text(String),
}

impl IotId {
    /// Form used inside entity paths, e.g. `Things(42)` or `Things('a1')`
    pub fn path_segment(&self) -> String {
        match self {
            IotId::Number(n) => n.to_string(),
            IotId::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// Parse the id out of an entity URL such as `.../Things(42)`
    pub fn from_entity_url(url: &str) -> Option<Self> {
        let start = url.rfind('(')? + 1;
        let end = url[start..].find(')')? + start;
        let raw = &url[start..end];
        if let Some(text) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            return Some(IotId::Text(text.replace("''", "'")));
        }
        raw.parse().ok().map(IotId::Number)
    }
}

impl fmt::Display for IotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IotId::Number(n) => write!(f, "{}", n),
            IotId::Text(s) => f.write_str(s),
        }
    }
}

/// `{"@iot.id": ...}` reference to another entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "@iot.id")]
    pub id: IotId,
}

impl From<IotId> for EntityRef {
    fn from(id: IotId) -> Self {
        Self { id }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitOfMeasurement {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    #[serde(rename = "@iot.id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IotId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(rename = "Locations", default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
}

impl Thing {
    pub fn trial_id(&self) -> Option<&str> {
        self.properties.get("trial_id").and_then(Value::as_str)
    }

    /// Plot id as a string, whether stored as a string or a number
    pub fn plot_id(&self) -> Option<String> {
        match self.properties.get("plot_id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(rename = "@iot.id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IotId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub encoding_type: String,
    /// GeoJSON Feature or Geometry
    pub location: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datastream {
    #[serde(rename = "@iot.id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IotId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub observation_type: String,
    #[serde(default)]
    pub unit_of_measurement: UnitOfMeasurement,
    #[serde(rename = "Sensor", default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<EntityRef>,
    #[serde(rename = "ObservedProperty", default, skip_serializing_if = "Option::is_none")]
    pub observed_property: Option<EntityRef>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(rename = "Thing", default, skip_serializing_if = "Option::is_none")]
    pub thing: Option<EntityRef>,
}

impl Datastream {
    pub fn raster_data(&self) -> Option<&str> {
        self.properties.get("raster_data").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    #[serde(rename = "@iot.id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IotId>,
    pub phenomenon_time: String,
    pub result_time: String,
    pub result: f64,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// `None` only for dry-run previews of datastreams that do not exist yet
    #[serde(rename = "Datastream", default, skip_serializing_if = "Option::is_none")]
    pub datastream: Option<EntityRef>,
}

/// Plot statistics carried by one observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservationValues {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub median: f64,
    pub count: usize,
}

impl Observation {
    /// Observation whose result is the plot mean; the other statistics go
    /// into `parameters`
    pub fn from_values(
        values: &ObservationValues,
        phenomenon_time: DateTime<FixedOffset>,
        result_time: DateTime<Utc>,
        datastream: Option<IotId>,
    ) -> Self {
        let parameters = json!({
            "min": values.min,
            "max": values.max,
            "stddev": values.std_dev,
            "median": values.median,
            "count": values.count,
        });
        Self {
            id: None,
            phenomenon_time: phenomenon_time.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            result_time: result_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            result: values.mean,
            parameters: match parameters {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            datastream: datastream.map(EntityRef::from),
        }
    }
}

/// Paged collection response (`value` + `@iot.nextLink`)
#[derive(Debug, Clone, Deserialize)]
pub struct Collection<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@iot.nextLink", default)]
    pub next_link: Option<String>,
}

// ---------------------------------------------------------------------------
// Plot payloads
// ---------------------------------------------------------------------------

/// Everything needed to describe one trial plot as a Thing
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSite {
    pub trial_id: String,
    pub plot_id: String,
    pub treatment_id: Option<String>,
    pub year: i32,
    /// Representative point (x, y) in the plot's CRS
    pub location: Option<(f64, f64)>,
}

impl PlotSite {
    pub fn key(&self) -> ThingKey {
        ThingKey::new(&self.trial_id, &self.plot_id)
    }

    /// `{trial}-{plot}` label used in names and templates
    pub fn label(&self) -> String {
        format!("{}-{}", self.trial_id, self.plot_id)
    }

    /// Creation payload for the plot's Thing with a deep-inserted Location
    pub fn thing(&self) -> Thing {
        let label = self.label();
        let mut properties = Map::new();
        properties.insert("trial_id".into(), json!(self.trial_id));
        properties.insert("plot_id".into(), json!(self.plot_id));
        if let Some(treatment) = self.treatment_id.as_ref().filter(|t| !t.is_empty()) {
            properties.insert("treatment_id".into(), json!(treatment));
        }
        properties.insert("year".into(), json!(self.year));

        let locations = self
            .location
            .map(|(x, y)| Location {
                id: None,
                name: format!("Location of Trial Plot - {}", label),
                description: format!("Representative point of Trial Plot - {}", label),
                encoding_type: GEOJSON_ENCODING.into(),
                location: json!({
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [x, y]},
                    "properties": {"trial_id": self.trial_id, "plot_id": self.plot_id},
                }),
            })
            .into_iter()
            .collect();

        Thing {
            id: None,
            name: format!("Trial Plot - {}", label),
            description: format!(
                "Agricultural trial plot {} belonging to trial {}",
                self.plot_id, self.trial_id
            ),
            properties,
            locations,
        }
    }
}

fn default_observation_type() -> String {
    OM_MEASUREMENT.to_string()
}

/// A configured datastream definition, instantiated once per plot.
///
/// `name` and `description` may contain `{plot_id}`, replaced by
/// `{trial}-{plot}`. The vegetation index is taken from `index` or, as in
/// older configuration files, from `properties.raster_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastreamTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(
        rename = "observationType",
        alias = "observation_type",
        default = "default_observation_type"
    )]
    pub observation_type: String,
    #[serde(rename = "unitOfMeasurement", alias = "unit", default)]
    pub unit_of_measurement: UnitOfMeasurement,
    #[serde(rename = "Sensor", default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<EntityRef>,
    #[serde(rename = "ObservedProperty", default, skip_serializing_if = "Option::is_none")]
    pub observed_property: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl DatastreamTemplate {
    /// Vegetation index this datastream carries
    pub fn raster_data(&self) -> Option<&str> {
        self.index
            .as_deref()
            .or_else(|| self.properties.get("raster_data").and_then(Value::as_str))
    }

    /// Creation payload for `site`, linked to its Thing
    pub fn datastream_for(&self, site: &PlotSite, thing_id: IotId) -> Datastream {
        let label = site.label();
        let mut properties = self.properties.clone();
        if let Some(raster_data) = self.raster_data() {
            properties.insert("raster_data".into(), json!(raster_data));
        }
        properties.insert("trial_id".into(), json!(site.trial_id));
        properties.insert("plot_id".into(), json!(site.plot_id));

        Datastream {
            id: None,
            name: self.name.replace("{plot_id}", &label),
            description: self.description.replace("{plot_id}", &label),
            observation_type: self.observation_type.clone(),
            unit_of_measurement: self.unit_of_measurement.clone(),
            sensor: self.sensor.clone(),
            observed_property: self.observed_property.clone(),
            properties,
            thing: Some(thing_id.into()),
        }
    }
}
