//! Run configuration: parsing, overrides and fail-fast validation.
//!
//! A configuration document is parsed into [`PipelineConfig`] and checked
//! once, before any raster or registry work, by [`PipelineConfig::plan`].
//! Every problem is a [`PipelineError::Config`].

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use raster2sensor_algorithms::imagery::VegetationIndex;
use raster2sensor_core::BandRole;
use raster2sensor_sensorthings::models::OM_MEASUREMENT;
use raster2sensor_sensorthings::{
    normalize_base_url, DatastreamTemplate, EntityRef, IotId, RetryPolicy, UnitOfMeasurement,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Serialization format of a configuration document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Format from the file extension (`.yml`, `.yaml`, `.json`)
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "yml" | "yaml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(PipelineError::Config(format!(
                "unsupported configuration format '.{}' ({}); use .yml, .yaml or .json",
                other,
                path.display()
            ))),
        }
    }
}

impl FromStr for ConfigFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(PipelineError::Config(format!("unknown format '{}'", other))),
        }
    }
}

/// One configured raster image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterImageConfig {
    pub path: PathBuf,
    /// RFC 3339 acquisition time, used as the observation phenomenon time
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One configured vegetation index with its band mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegetationIndexConfig {
    pub name: String,
    /// Alias accepted by `--indices`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    /// Band role (`red`, `nir_band`, ...) to 1-based band index
    #[serde(default)]
    pub bands: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// HTTP timeout and retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            timeout_secs: 30,
            max_attempts: retry.max_attempts,
            backoff_base_ms: retry.backoff_base_ms,
            backoff_max_ms: retry.backoff_max_ms,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }
}

/// Bounds on concurrent work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Images processed at the same time
    pub images: usize,
    /// Registry and observation requests in flight at the same time
    pub requests: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            images: 2,
            requests: 8,
        }
    }
}

/// The configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot_id_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment_id_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensorthingsapi_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pygeoapi_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plots_file: Option<PathBuf>,
    #[serde(default)]
    pub datastreams: Vec<DatastreamTemplate>,
    #[serde(default)]
    pub raster_images: Vec<RasterImageConfig>,
    #[serde(default)]
    pub vegetation_indices: Vec<VegetationIndexConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

/// Command-line values that take precedence over the document
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub trial_id: Option<String>,
    pub plot_id_field: Option<String>,
    pub treatment_id_field: Option<String>,
    pub year: Option<i32>,
    pub sensorthingsapi_url: Option<String>,
    pub pygeoapi_url: Option<String>,
    pub plots_file: Option<PathBuf>,
}

/// `--indices` / `--images` filters. `None` selects everything.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub indices: Option<Vec<String>>,
    pub images: Option<Vec<String>>,
}

/// A selected index with its own band mapping and datastream
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedIndex {
    pub index: VegetationIndex,
    pub bands: BTreeMap<BandRole, usize>,
    pub datastream: DatastreamTemplate,
}

impl PlannedIndex {
    /// Required roles that the index's own band mapping leaves out
    pub fn unmapped_roles(&self) -> Vec<BandRole> {
        self.index
            .required_roles()
            .iter()
            .copied()
            .filter(|r| !self.bands.contains_key(r))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedImage {
    pub path: PathBuf,
    pub timestamp: DateTime<FixedOffset>,
}

/// Validated, immutable description of one `process-images` run
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub trial_id: String,
    pub year: i32,
    pub plot_id_field: String,
    pub treatment_id_field: Option<String>,
    pub plots_file: PathBuf,
    pub sensorthingsapi_url: String,
    pub images: Vec<PlannedImage>,
    pub indices: Vec<PlannedIndex>,
    /// Union of the selected indices' band mappings
    pub band_map: BTreeMap<BandRole, usize>,
    pub http: HttpConfig,
    pub concurrency: ConcurrencyConfig,
}

fn config_err(msg: impl Into<String>) -> PipelineError {
    PipelineError::Config(msg.into())
}

impl PipelineConfig {
    /// Read a YAML or JSON document; the format follows the extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_err(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text, format)
            .map_err(|e| config_err(format!("{}: {}", path.display(), e.reason())))
    }

    pub fn parse(text: &str, format: ConfigFormat) -> Result<Self> {
        match format {
            ConfigFormat::Yaml => serde_yaml::from_str(text).map_err(|e| config_err(e.to_string())),
            ConfigFormat::Json => serde_json::from_str(text).map_err(|e| config_err(e.to_string())),
        }
    }

    pub fn to_string(&self, format: ConfigFormat) -> Result<String> {
        match format {
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(|e| config_err(e.to_string())),
            ConfigFormat::Json => {
                serde_json::to_string_pretty(self).map_err(|e| config_err(e.to_string()))
            }
        }
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            trial_id,
            plot_id_field,
            treatment_id_field,
            year,
            sensorthingsapi_url,
            pygeoapi_url,
            plots_file,
        } = overrides;
        macro_rules! take {
            ($($field:ident),*) => {
                $(if $field.is_some() { self.$field = $field; })*
            };
        }
        take!(
            trial_id,
            plot_id_field,
            treatment_id_field,
            year,
            sensorthingsapi_url,
            pygeoapi_url,
            plots_file
        );
    }

    pub fn trial_id(&self) -> Result<&str> {
        self.trial_id
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| config_err("trial_id is required"))
    }

    pub fn plot_id_field(&self) -> Result<&str> {
        self.plot_id_field
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| config_err("plot_id_field is required"))
    }

    pub fn plots_file(&self) -> Result<&Path> {
        self.plots_file
            .as_deref()
            .ok_or_else(|| config_err("plots_file is required"))
    }

    /// Configured year, or the current one
    pub fn year(&self) -> i32 {
        self.year.unwrap_or_else(|| Utc::now().year())
    }

    /// Normalized SensorThings base URL
    pub fn sensorthings_url(&self) -> Result<String> {
        let url = self
            .sensorthingsapi_url
            .as_deref()
            .ok_or_else(|| config_err("sensorthingsapi_url is required"))?;
        normalize_base_url(url).map_err(|e| config_err(format!("sensorthingsapi_url: {}", e)))
    }

    /// Normalized OGC API Processes base URL
    pub fn processes_url(&self) -> Result<String> {
        let url = self
            .pygeoapi_url
            .as_deref()
            .ok_or_else(|| config_err("pygeoapi_url is required"))?;
        normalize_base_url(url).map_err(|e| config_err(format!("pygeoapi_url: {}", e)))
    }

    /// Every datastream definition, each required to name its index
    pub fn datastream_templates(&self) -> Result<&[DatastreamTemplate]> {
        if self.datastreams.is_empty() {
            return Err(config_err("no datastreams configured"));
        }
        for ds in &self.datastreams {
            if ds.name.trim().is_empty() {
                return Err(config_err("datastream without a name"));
            }
            if ds.raster_data().is_none() {
                return Err(config_err(format!(
                    "datastream '{}' names no vegetation index (set 'index' or properties.raster_data)",
                    ds.name
                )));
            }
        }
        Ok(&self.datastreams)
    }

    fn datastream_for(&self, index: VegetationIndex) -> Result<DatastreamTemplate> {
        self.datastreams
            .iter()
            .find(|ds| {
                ds.raster_data()
                    .is_some_and(|r| r.eq_ignore_ascii_case(index.name()))
            })
            .cloned()
            .ok_or_else(|| config_err(format!("no datastream is configured for {}", index)))
    }

    /// Validate the document against `selection` and produce the run plan.
    pub fn plan(&self, selection: &Selection) -> Result<RunPlan> {
        let trial_id = self.trial_id()?.to_string();
        let plot_id_field = self.plot_id_field()?.to_string();
        let plots_file = self.plots_file()?.to_path_buf();
        let sensorthingsapi_url = self.sensorthings_url()?;
        if self.http.max_attempts == 0 {
            return Err(config_err("http.max_attempts must be at least 1"));
        }
        if self.concurrency.images == 0 || self.concurrency.requests == 0 {
            return Err(config_err("concurrency limits must be at least 1"));
        }

        let indices = self.select_indices(selection.indices.as_deref())?;
        let images = self.select_images(selection.images.as_deref())?;

        let mut band_map: BTreeMap<BandRole, usize> = BTreeMap::new();
        for planned in &indices {
            for (&role, &band) in &planned.bands {
                match band_map.insert(role, band) {
                    Some(previous) if previous != band => {
                        return Err(config_err(format!(
                            "band role '{}' is mapped to both band {} and band {}",
                            role, previous, band
                        )));
                    }
                    _ => {}
                }
            }
        }

        Ok(RunPlan {
            trial_id,
            year: self.year(),
            plot_id_field,
            treatment_id_field: self.treatment_id_field.clone(),
            plots_file,
            sensorthingsapi_url,
            images,
            indices,
            band_map,
            http: self.http,
            concurrency: self.concurrency,
        })
    }

    fn select_indices(&self, filter: Option<&[String]>) -> Result<Vec<PlannedIndex>> {
        if self.vegetation_indices.is_empty() {
            return Err(config_err("no vegetation_indices configured"));
        }
        if let Some(filter) = filter {
            for wanted in filter {
                let known = self.vegetation_indices.iter().any(|vi| index_matches(vi, wanted));
                if !known {
                    return Err(config_err(format!(
                        "--indices: '{}' is not a configured vegetation index",
                        wanted
                    )));
                }
            }
        }

        let mut planned = Vec::new();
        for vi in &self.vegetation_indices {
            if let Some(filter) = filter {
                if !filter.iter().any(|w| index_matches(vi, w)) {
                    continue;
                }
            }
            let index = VegetationIndex::from_str(&vi.name)
                .map_err(|_| config_err(format!("unknown vegetation index '{}'", vi.name)))?;
            if planned.iter().any(|p: &PlannedIndex| p.index == index) {
                return Err(config_err(format!("vegetation index {} is configured twice", index)));
            }

            let mut bands = BTreeMap::new();
            for (key, &band) in &vi.bands {
                let role = BandRole::from_str(key)
                    .map_err(|_| config_err(format!("{}: unknown band role '{}'", vi.name, key)))?;
                if band == 0 {
                    return Err(config_err(format!(
                        "{}: band '{}' must be at least 1 (bands are 1-indexed)",
                        vi.name, key
                    )));
                }
                if let Some(previous) = bands.insert(role, band) {
                    if previous != band {
                        return Err(config_err(format!(
                            "{}: band role '{}' is mapped twice",
                            vi.name, role
                        )));
                    }
                }
            }

            planned.push(PlannedIndex {
                index,
                bands,
                datastream: self.datastream_for(index)?,
            });
        }
        Ok(planned)
    }

    fn select_images(&self, filter: Option<&[String]>) -> Result<Vec<PlannedImage>> {
        if self.raster_images.is_empty() {
            return Err(config_err("no raster_images configured"));
        }
        if let Some(filter) = filter {
            for wanted in filter {
                if !self.raster_images.iter().any(|img| image_matches(img, wanted)) {
                    return Err(config_err(format!(
                        "--images: '{}' is not a configured raster image",
                        wanted
                    )));
                }
            }
        }

        self.raster_images
            .iter()
            .filter(|img| filter.map_or(true, |f| f.iter().any(|w| image_matches(img, w))))
            .map(|img| {
                let timestamp = DateTime::parse_from_rfc3339(img.timestamp.trim()).map_err(|e| {
                    config_err(format!(
                        "{}: timestamp '{}' is not RFC 3339: {}",
                        img.path.display(),
                        img.timestamp,
                        e
                    ))
                })?;
                Ok(PlannedImage {
                    path: img.path.clone(),
                    timestamp,
                })
            })
            .collect()
    }
}

fn index_matches(vi: &VegetationIndexConfig, wanted: &str) -> bool {
    let wanted = wanted.trim();
    vi.name.eq_ignore_ascii_case(wanted)
        || vi
            .process
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(wanted))
}

/// An image matches by its configured path or by its file name
fn image_matches(img: &RasterImageConfig, wanted: &str) -> bool {
    let wanted = wanted.trim();
    img.path == Path::new(wanted)
        || img
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == wanted)
}

/// Complete sample document: six datastreams, two images, six indices
pub fn sample_config() -> PipelineConfig {
    let indices: [(VegetationIndex, &str, &str, &[(&str, usize)]); 6] = [
        (
            VegetationIndex::Ndvi,
            "Normalized Difference Vegetation Index",
            "(NIR - Red) / (NIR + Red)",
            &[("red_band", 2), ("nir_band", 5)],
        ),
        (
            VegetationIndex::Ndre,
            "Normalized Difference Red Edge Index",
            "(NIR - RedEdge) / (NIR + RedEdge)",
            &[("red_edge_band", 3), ("nir_band", 5)],
        ),
        (
            VegetationIndex::Gndvi,
            "Green Normalized Difference Vegetation Index",
            "(NIR - Green) / (NIR + Green)",
            &[("green_band", 1), ("nir_band", 5)],
        ),
        (
            VegetationIndex::Savi,
            "Soil Adjusted Vegetation Index",
            "(NIR - Red) / (NIR + Red + L) * (1 + L)",
            &[("red_band", 2), ("nir_band", 5)],
        ),
        (
            VegetationIndex::CiRedEdge,
            "Chlorophyll Index Red Edge",
            "(NIR / RedEdge) - 1",
            &[("red_edge_band", 3), ("nir_band", 5)],
        ),
        (
            VegetationIndex::Mcari,
            "Modified Chlorophyll Absorption Ratio Index",
            "[(RedEdge - Red) - 0.2 * (RedEdge - Green)] * (RedEdge / Red)",
            &[("green_band", 1), ("red_band", 2), ("red_edge_band", 3)],
        ),
    ];

    let datastreams = indices
        .iter()
        .enumerate()
        .map(|(i, (index, long_name, formula, _))| {
            let mut properties = Map::new();
            properties.insert("raster_data".into(), json!(index.name()));
            properties.insert(
                "spectral_index".into(),
                json!({"name": index.name(), "formula": formula}),
            );
            DatastreamTemplate {
                name: format!("{} - Trial Plot {{plot_id}}", index.name()),
                description: format!("{} ({}) for Trial Plot {{plot_id}}", long_name, index.name()),
                observation_type: OM_MEASUREMENT.into(),
                unit_of_measurement: UnitOfMeasurement {
                    name: String::new(),
                    symbol: String::new(),
                    definition: long_name.to_string(),
                },
                sensor: Some(EntityRef::from(IotId::Number(1))),
                observed_property: Some(EntityRef::from(IotId::Number(i as i64 + 1))),
                index: None,
                properties,
            }
        })
        .collect();

    let vegetation_indices = indices
        .iter()
        .map(|(index, long_name, _, bands)| VegetationIndexConfig {
            name: index.name().to_string(),
            process: Some(index.name().to_ascii_lowercase()),
            bands: bands.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            description: Some(long_name.to_string()),
        })
        .collect();

    PipelineConfig {
        trial_id: Some("Goetheweg-2024".into()),
        plot_id_field: Some("ID".into()),
        treatment_id_field: None,
        year: Some(2024),
        sensorthingsapi_url: Some("http://localhost:8080/FROST-Server/v1.1".into()),
        pygeoapi_url: Some("http://localhost:5000".into()),
        plots_file: Some(PathBuf::from("data/trial_plots.geojson")),
        datastreams,
        raster_images: vec![
            RasterImageConfig {
                path: PathBuf::from("data/DOP_20240306_TD_D1_Rangacker_MCA_4cm_UTM32.tif"),
                timestamp: "2024-03-06T09:00:00+01:00".into(),
                description: Some("UAV Image from March 6, 2024".into()),
            },
            RasterImageConfig {
                path: PathBuf::from("data/DOP_AD24_TD_20240405_D2_MCA_V2_3cm_UTM32.tif"),
                timestamp: "2024-04-05T09:00:00+01:00".into(),
                description: Some("UAV Image from April 5, 2024".into()),
            },
        ],
        vegetation_indices,
        http: HttpConfig::default(),
        concurrency: ConcurrencyConfig::default(),
    }
}

/// Write [`sample_config`] to `path`
pub fn write_sample_config<P: AsRef<Path>>(path: P, format: ConfigFormat) -> Result<()> {
    let path = path.as_ref();
    let text = sample_config().to_string(format)?;
    std::fs::write(path, text)
        .map_err(|e| config_err(format!("cannot write {}: {}", path.display(), e)))?;
    tracing::info!(path = %path.display(), "sample configuration written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PipelineConfig {
        let mut c = sample_config();
        c.raster_images[0].path = PathBuf::from("/data/a.tif");
        c.raster_images[1].path = PathBuf::from("/data/b.tif");
        c
    }

    #[test]
    fn sample_config_plans() {
        let plan = valid().plan(&Selection::default()).unwrap();
        assert_eq!(plan.indices.len(), 6);
        assert_eq!(plan.images.len(), 2);
        assert_eq!(plan.trial_id, "Goetheweg-2024");
        assert_eq!(plan.band_map.get(&BandRole::Nir), Some(&5));
        assert_eq!(plan.band_map.get(&BandRole::RedEdge), Some(&3));
        assert_eq!(plan.http.timeout_secs, 30);
        assert_eq!(plan.concurrency.images, 2);
    }

    #[test]
    fn sample_config_roundtrips_through_both_formats() {
        let sample = sample_config();
        for format in [ConfigFormat::Yaml, ConfigFormat::Json] {
            let text = sample.to_string(format).unwrap();
            assert_eq!(PipelineConfig::parse(&text, format).unwrap(), sample);
        }
    }

    #[test]
    fn indices_filter_selects_by_name_or_process() {
        let config = valid();
        let sel = Selection {
            indices: Some(vec!["ndvi".into()]),
            images: None,
        };
        let plan = config.plan(&sel).unwrap();
        assert_eq!(plan.indices.len(), 1);
        assert_eq!(plan.indices[0].index, VegetationIndex::Ndvi);

        let sel = Selection {
            indices: Some(vec!["cirededge".into(), "MCARI".into()]),
            images: None,
        };
        let names: Vec<_> = config
            .plan(&sel)
            .unwrap()
            .indices
            .iter()
            .map(|p| p.index)
            .collect();
        assert_eq!(names, vec![VegetationIndex::CiRedEdge, VegetationIndex::Mcari]);
    }

    #[test]
    fn indices_filter_drops_unselected_definitions() {
        let mut config = valid();
        config
            .vegetation_indices
            .retain(|v| v.name == "NDVI" || v.name == "NDRE");
        config.vegetation_indices.push(VegetationIndexConfig {
            name: "VARI".into(),
            process: Some("vari".into()),
            bands: [("green_band", 1), ("red_band", 2), ("blue_band", 4)]
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            description: None,
        });

        let sel = Selection {
            indices: Some(vec!["ndvi".into()]),
            images: None,
        };
        let plan = config.plan(&sel).unwrap();
        assert_eq!(plan.indices.len(), 1);
        assert_eq!(plan.indices[0].index, VegetationIndex::Ndvi);
        // Only the bands NDVI reads are mapped
        assert_eq!(plan.band_map.len(), 2);
        assert!(plan.band_map.get(&BandRole::Blue).is_none());
    }

    #[test]
    fn unknown_filters_are_config_errors() {
        let config = valid();
        let sel = Selection {
            indices: Some(vec!["evi".into()]),
            images: None,
        };
        assert!(matches!(config.plan(&sel), Err(PipelineError::Config(_))));

        let sel = Selection {
            indices: None,
            images: Some(vec!["missing.tif".into()]),
        };
        assert!(matches!(config.plan(&sel), Err(PipelineError::Config(_))));
    }

    #[test]
    fn images_filter_matches_file_name() {
        let sel = Selection {
            indices: None,
            images: Some(vec!["b.tif".into()]),
        };
        let plan = valid().plan(&sel).unwrap();
        assert_eq!(plan.images.len(), 1);
        assert_eq!(plan.images[0].path, PathBuf::from("/data/b.tif"));
    }

    #[test]
    fn conflicting_band_roles_are_rejected() {
        let mut config = valid();
        config.vegetation_indices[1].bands.insert("nir".into(), 4);
        let err = config.plan(&Selection::default()).unwrap_err();
        assert!(err.reason().contains("nir"), "{}", err);

        // Not a conflict when the other index is filtered out
        let sel = Selection {
            indices: Some(vec!["ndvi".into()]),
            images: None,
        };
        assert!(config.plan(&sel).is_ok());
    }

    #[test]
    fn rejects_bad_fields() {
        let mut c = valid();
        c.raster_images[0].timestamp = "06.03.2024 09:00".into();
        assert!(c.plan(&Selection::default()).is_err());

        let mut c = valid();
        c.vegetation_indices[0].bands.insert("swir".into(), 6);
        assert!(c.plan(&Selection::default()).is_err());

        let mut c = valid();
        c.vegetation_indices[0].bands.insert("red".into(), 0);
        assert!(c.plan(&Selection::default()).is_err());

        let mut c = valid();
        c.vegetation_indices[0].name = "EVI".into();
        assert!(c.plan(&Selection::default()).is_err());

        let mut c = valid();
        c.trial_id = None;
        assert!(c.plan(&Selection::default()).is_err());

        let mut c = valid();
        c.sensorthingsapi_url = Some("not a url".into());
        assert!(c.plan(&Selection::default()).is_err());

        let mut c = valid();
        c.datastreams.retain(|d| d.raster_data() != Some("NDVI"));
        assert!(c.plan(&Selection::default()).is_err());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut c = valid();
        c.apply(ConfigOverrides {
            trial_id: Some("Other-2025".into()),
            year: Some(2025),
            ..Default::default()
        });
        let plan = c.plan(&Selection::default()).unwrap();
        assert_eq!(plan.trial_id, "Other-2025");
        assert_eq!(plan.year, 2025);
        assert_eq!(plan.plot_id_field, "ID");
    }

    #[test]
    fn year_defaults_to_current() {
        let mut c = valid();
        c.year = None;
        assert_eq!(c.year(), Utc::now().year());
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("c.YML")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("c.json")).unwrap(), ConfigFormat::Json);
        assert!(ConfigFormat::from_path(Path::new("c.toml")).is_err());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        write_sample_config(&path, ConfigFormat::Yaml).unwrap();
        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, sample_config());
    }
}
