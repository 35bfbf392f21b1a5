//! End-to-end runs of the image-to-observation pipeline against the
//! in-memory registry.

use approx::assert_relative_eq;
use raster2sensor_core::io::write_geotiff_bands;
use raster2sensor_core::{GeoTransform, Raster, CRS};
use raster2sensor_pipeline::{
    sample_config, FailureScope, ObservationStatus, Pipeline, PipelineConfig, RunContext,
    RunSummary, Selection,
};
use raster2sensor_pipeline::config::{RasterImageConfig, VegetationIndexConfig};
use raster2sensor_sensorthings::memory::MemoryRegistry;
use raster2sensor_sensorthings::{CancelFlag, SensorThingsApi};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// 10x10 image over x 0..10, y 0..10 with constant bands:
/// red = 1, nir = 2, green = 3, red edge = 1.5
fn write_image(path: &Path) {
    let band = |v: f64| {
        let mut r = Raster::filled(10, 10, v);
        r.set_transform(GeoTransform::new(0.0, 10.0, 1.0, -1.0));
        r.set_crs(Some(CRS::from_epsg(25832)));
        r
    };
    write_geotiff_bands(&[band(1.0), band(2.0), band(3.0), band(1.5)], path).unwrap();
}

fn square(id: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> serde_json::Value {
    json!({
        "type": "Feature",
        "properties": {"ID": id, "treatment": "T1"},
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[x0, y0], [x1, y0], [x1, y1], [x0, y1], [x0, y0]]]
        }
    })
}

fn write_plots(path: &Path) {
    let fc = json!({
        "type": "FeatureCollection",
        "features": [
            // 9 cells
            square("1", 1.0, 1.0, 4.0, 4.0),
            square("2", 6.0, 6.0, 9.0, 9.0),
            // outside the image
            square("3", 20.0, 20.0, 25.0, 25.0),
            // half outside: cell centres x 8.5, 9.5 and y 5.5, 6.5
            square("4", 8.0, 5.0, 12.0, 7.0),
        ]
    });
    std::fs::write(path, fc.to_string()).unwrap();
}

fn index(name: &str, bands: &[(&str, usize)]) -> VegetationIndexConfig {
    VegetationIndexConfig {
        name: name.into(),
        process: Some(name.to_ascii_lowercase()),
        bands: bands.iter().map(|(k, v)| (k.to_string(), *v)).collect::<BTreeMap<_, _>>(),
        description: None,
    }
}

struct Fixture {
    _dir: TempDir,
    config: PipelineConfig,
    first_image: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let first_image = dir.path().join("flight_0306.tif");
    let second_image = dir.path().join("flight_0405.tif");
    let plots = dir.path().join("plots.geojson");
    write_image(&first_image);
    write_image(&second_image);
    write_plots(&plots);

    let mut config = sample_config();
    config.trial_id = Some("Goetheweg-2024".into());
    config.plot_id_field = Some("ID".into());
    config.treatment_id_field = Some("treatment".into());
    config.plots_file = Some(plots);
    config.http.max_attempts = 1;
    config.raster_images = vec![
        RasterImageConfig {
            path: first_image.clone(),
            timestamp: "2024-03-06T09:00:00+01:00".into(),
            description: None,
        },
        RasterImageConfig {
            path: second_image,
            timestamp: "2024-04-05T09:00:00+01:00".into(),
            description: None,
        },
    ];
    config.vegetation_indices = vec![
        index("NDVI", &[("red_band", 1), ("nir_band", 2)]),
        index("NDRE", &[("red_edge_band", 4), ("nir_band", 2)]),
        index("GNDVI", &[("green_band", 3), ("nir_band", 2)]),
    ];

    Fixture {
        _dir: dir,
        config,
        first_image,
    }
}

async fn run(
    config: &PipelineConfig,
    selection: Selection,
    registry: &Arc<MemoryRegistry>,
    dry_run: bool,
) -> RunSummary {
    let plan = config.plan(&selection).unwrap();
    let api: Arc<dyn SensorThingsApi> = registry.clone();
    Pipeline::new(plan, RunContext::new(dry_run), api)
        .run()
        .await
        .unwrap()
}

fn only(indices: &[&str]) -> Selection {
    Selection {
        indices: Some(indices.iter().map(|s| s.to_string()).collect()),
        images: None,
    }
}

#[tokio::test]
async fn publishes_ndvi_means_per_plot() {
    let fx = fixture();
    let registry = Arc::new(MemoryRegistry::new());
    let summary = run(&fx.config, only(&["ndvi"]), &registry, false).await;

    // 2 images x (plots 1, 2, 4 with data); plot 3 is outside the image
    assert_eq!(summary.published, 6);
    assert_eq!(summary.skipped, 2);
    assert!(summary.failures.is_empty(), "{:?}", summary.failures);
    assert_eq!(summary.exit_code(), 0);

    let observations = registry.observations();
    assert_eq!(observations.len(), 6);
    for obs in &observations {
        assert_relative_eq!(obs.result, 1.0 / 3.0, epsilon = 1e-12);
    }
    let counts: Vec<u64> = observations
        .iter()
        .filter_map(|o| o.parameters.get("count").and_then(|c| c.as_u64()))
        .collect();
    assert_eq!(counts.iter().filter(|&&c| c == 9).count(), 4);
    assert_eq!(counts.iter().filter(|&&c| c == 4).count(), 2);

    // One Thing per plot with data and one NDVI Datastream each
    assert_eq!(registry.thing_count(), 3);
    assert_eq!(registry.datastream_count(), 3);
    assert_eq!(summary.things_created, 3);
}

#[tokio::test]
async fn rerun_creates_no_duplicates() {
    let fx = fixture();
    let registry = Arc::new(MemoryRegistry::new());
    run(&fx.config, Selection::default(), &registry, false).await;
    let (things, datastreams) = (registry.thing_count(), registry.datastream_count());
    assert_eq!(datastreams, things * 3);

    let second = run(&fx.config, Selection::default(), &registry, false).await;
    assert_eq!(registry.thing_count(), things);
    assert_eq!(registry.datastream_count(), datastreams);
    assert_eq!(second.things_created, 0);
    assert_eq!(second.datastreams_created, 0);
    assert_eq!(second.published, 18);
}

#[tokio::test]
async fn dry_run_writes_nothing_and_matches_live_values() {
    let fx = fixture();
    let registry = Arc::new(MemoryRegistry::new());
    let dry = run(&fx.config, Selection::default(), &registry, true).await;
    assert_eq!(registry.writes(), 0);
    assert_eq!(dry.published, 0);
    assert_eq!(dry.would_publish, 18);
    assert!(dry
        .observations
        .iter()
        .filter(|o| o.status != ObservationStatus::Skipped)
        .all(|o| o.status == ObservationStatus::WouldPublish));

    let live = run(&fx.config, Selection::default(), &registry, false).await;
    assert_eq!(live.published, 18);

    let values = |s: &RunSummary| -> Vec<(String, String, String, f64, usize)> {
        s.observations
            .iter()
            .filter(|o| o.count > 0)
            .map(|o| (o.image.clone(), o.index.clone(), o.plot_id.clone(), o.mean, o.count))
            .collect()
    };
    assert_eq!(values(&dry), values(&live));

    // Once the registry has the entities, a dry run still writes nothing
    let writes = registry.writes();
    run(&fx.config, Selection::default(), &registry, true).await;
    assert_eq!(registry.writes(), writes);
}

#[tokio::test]
async fn indices_filter_restricts_processing() {
    let fx = fixture();
    let registry = Arc::new(MemoryRegistry::new());
    let summary = run(&fx.config, only(&["ndvi"]), &registry, false).await;

    assert!(summary.observations.iter().all(|o| o.index == "NDVI"));
    let raster_data: Vec<_> = registry
        .datastreams()
        .iter()
        .filter_map(|d| d.raster_data().map(str::to_string))
        .collect();
    assert!(!raster_data.is_empty());
    assert!(raster_data.iter().all(|r| r == "NDVI"));
}

#[tokio::test]
async fn images_filter_selects_one_image() {
    let fx = fixture();
    let registry = Arc::new(MemoryRegistry::new());
    let selection = Selection {
        indices: Some(vec!["NDVI".into()]),
        images: Some(vec!["flight_0405.tif".into()]),
    };
    let summary = run(&fx.config, selection, &registry, false).await;
    assert_eq!(summary.images, 1);
    assert_eq!(summary.published, 3);
    assert!(summary.observations.iter().all(|o| o.image == "flight_0405.tif"));
}

#[tokio::test]
async fn unreadable_image_fails_alone() {
    let mut fx = fixture();
    std::fs::write(&fx.first_image, b"not a tiff").unwrap();
    fx.config.vegetation_indices.truncate(1);

    let registry = Arc::new(MemoryRegistry::new());
    let summary = run(&fx.config, Selection::default(), &registry, false).await;

    assert_eq!(summary.published, 3);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].scope, FailureScope::Image);
    assert_eq!(summary.failures[0].error, "RasterIOError");
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn index_with_incomplete_band_mapping_fails_alone() {
    let mut fx = fixture();
    // NDRE without its red edge band
    fx.config.vegetation_indices[1].bands.remove("red_edge_band");

    let registry = Arc::new(MemoryRegistry::new());
    let summary = run(&fx.config, Selection::default(), &registry, false).await;

    assert_eq!(summary.published, 12);
    assert_eq!(summary.failures.len(), 2);
    assert!(summary
        .failures
        .iter()
        .all(|f| f.scope == FailureScope::Index && f.error == "IndexComputationError"));
}

#[tokio::test]
async fn bad_plot_geometry_is_isolated() {
    let fx = fixture();
    let plots = fx.config.plots_file.clone().unwrap();
    let fc = json!({
        "type": "FeatureCollection",
        "features": [
            square("1", 1.0, 1.0, 4.0, 4.0),
            {"type": "Feature", "properties": {"ID": "9"}, "geometry": null},
        ]
    });
    std::fs::write(&plots, fc.to_string()).unwrap();

    let registry = Arc::new(MemoryRegistry::new());
    let summary = run(&fx.config, only(&["ndvi"]), &registry, false).await;
    assert_eq!(summary.published, 2);
    assert_eq!(summary.failures.len(), 2);
    assert!(summary
        .failures
        .iter()
        .all(|f| f.scope == FailureScope::Plot && f.error == "GeometryError"));
}

#[tokio::test]
async fn registry_failure_is_recorded_per_plot() {
    let fx = fixture();
    let registry = Arc::new(MemoryRegistry::new());
    // The first write is a Thing create; its rejection holds for both images
    registry.fail_next_writes(1, 400);

    let summary = run(&fx.config, only(&["ndvi"]), &registry, false).await;
    assert_eq!(summary.failures.len(), 2);
    assert!(summary
        .failures
        .iter()
        .all(|f| f.scope == FailureScope::Plot && f.error == "RegistryError"));
    let failed_plot = &summary.failures[0].key;
    let plot_suffix = failed_plot.rsplit('/').next().unwrap();
    assert!(summary.failures.iter().all(|f| f.key.ends_with(plot_suffix)));
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.published, 4);
    assert_eq!(registry.thing_count(), 2);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn rejected_observation_stops_the_run() {
    let fx = fixture();
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_next_writes_to("Observations", 1, 400);

    let plan = fx.config.plan(&only(&["ndvi"])).unwrap();
    let api: Arc<dyn SensorThingsApi> = registry.clone();
    let err = Pipeline::new(plan, RunContext::new(false), api)
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ConfigError");
    assert!(err.reason().contains("HTTP 400"), "{}", err.reason());
}

#[tokio::test]
async fn server_error_on_observation_is_recorded() {
    let fx = fixture();
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_next_writes_to("Observations", 1, 500);

    let summary = run(&fx.config, only(&["ndvi"]), &registry, false).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.published, 5);
    assert_eq!(summary.failures[0].error, "PublishError");
}

#[tokio::test]
async fn nodata_pixels_are_left_out_of_plot_statistics() {
    let fx = fixture();
    // Red is nodata at the cell centred on (2.5, 2.5), inside plot 1
    let band = |v: f64| {
        let mut r = Raster::filled(10, 10, v);
        r.set_transform(GeoTransform::new(0.0, 10.0, 1.0, -1.0));
        r.set_crs(Some(CRS::from_epsg(25832)));
        r.set_nodata(Some(-9999.0));
        r
    };
    let mut red = band(1.0);
    red.set(7, 2, -9999.0).unwrap();
    write_geotiff_bands(&[red, band(2.0), band(3.0), band(1.5)], &fx.first_image).unwrap();

    let registry = Arc::new(MemoryRegistry::new());
    let summary = run(&fx.config, only(&["ndvi"]), &registry, false).await;
    assert!(summary.failures.is_empty(), "{:?}", summary.failures);

    let plot1 = |image: &str| {
        summary
            .observations
            .iter()
            .find(|o| o.image == image && o.plot_id == "1")
            .cloned()
            .unwrap()
    };
    let with_gap = plot1("flight_0306.tif");
    assert_eq!(with_gap.count, 8);
    assert_relative_eq!(with_gap.mean, 1.0 / 3.0, epsilon = 1e-12);
    assert_eq!(plot1("flight_0405.tif").count, 9);
}

#[tokio::test]
async fn cancelled_run_publishes_nothing() {
    let fx = fixture();
    let registry = Arc::new(MemoryRegistry::new());
    let cancel = CancelFlag::new();
    cancel.cancel();

    let plan = fx.config.plan(&Selection::default()).unwrap();
    let api: Arc<dyn SensorThingsApi> = registry.clone();
    let summary = Pipeline::new(plan, RunContext::new(false).with_cancel(cancel), api)
        .run()
        .await
        .unwrap();

    assert_eq!(registry.writes(), 0);
    assert!(summary.cancelled);
    assert_eq!(summary.exit_code(), 130);
}

#[tokio::test]
async fn exports_derived_rasters() {
    let fx = fixture();
    let out = tempfile::tempdir().unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    let plan = fx.config.plan(&only(&["ndvi"])).unwrap();
    let api: Arc<dyn SensorThingsApi> = registry.clone();
    Pipeline::new(plan, RunContext::new(true), api)
        .with_output_dir(out.path())
        .run()
        .await
        .unwrap();

    let exported = out.path().join("flight_0306_NDVI.tif");
    let bands = raster2sensor_core::io::read_bands(&exported, &[1]).unwrap();
    assert_relative_eq!(bands[0].get(5, 5).unwrap(), 1.0 / 3.0, epsilon = 1e-6);
    assert!(out.path().join("flight_0405_NDVI.tif").exists());
}

#[tokio::test]
async fn missing_plots_file_is_a_config_error() {
    let mut fx = fixture();
    fx.config.plots_file = Some(PathBuf::from("/nonexistent/plots.geojson"));
    let plan = fx.config.plan(&Selection::default()).unwrap();
    let registry: Arc<dyn SensorThingsApi> = Arc::new(MemoryRegistry::new());
    let err = Pipeline::new(plan, RunContext::new(false), registry)
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ConfigError");
}
