//! Trial plot polygons loaded from vector files

use crate::crs::CRS;
use crate::error::{Error, Result};
use geo::{Area, InteriorPoint};
use geo_types::{Coord, LineString, MultiPolygon, Point, Polygon};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// One trial plot: identifier, polygonal footprint and optional treatment
#[derive(Debug, Clone, PartialEq)]
pub struct PlotGeometry {
    pub plot_id: String,
    /// `None` when the feature had no polygonal geometry
    pub geometry: Option<MultiPolygon<f64>>,
    pub treatment_id: Option<String>,
}

impl PlotGeometry {
    pub fn new(plot_id: impl Into<String>, geometry: MultiPolygon<f64>) -> Self {
        Self {
            plot_id: plot_id.into(),
            geometry: Some(geometry),
            treatment_id: None,
        }
    }

    /// The plot footprint, rejecting empty, malformed and zero-area shapes
    pub fn validated(&self) -> Result<&MultiPolygon<f64>> {
        let invalid = |reason: &str| Error::InvalidGeometry {
            plot_id: self.plot_id.clone(),
            reason: reason.to_string(),
        };

        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| invalid("missing or non-polygonal geometry"))?;

        if geometry.0.is_empty() {
            return Err(invalid("empty geometry"));
        }
        for polygon in geometry {
            let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors());
            for ring in rings {
                if ring.0.len() < 4 {
                    return Err(invalid("ring has fewer than 4 positions"));
                }
                if ring.0.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
                    return Err(invalid("non-finite coordinate"));
                }
            }
        }
        if geometry.unsigned_area() <= 0.0 {
            return Err(invalid("zero area"));
        }

        Ok(geometry)
    }

    /// A point guaranteed to lie inside the plot, used as its registry location
    pub fn representative_point(&self) -> Option<Point<f64>> {
        self.geometry.as_ref()?.interior_point()
    }
}

/// All plots of a trial, with the CRS declared by the source (if any)
#[derive(Debug, Clone, Default)]
pub struct PlotCollection {
    pub plots: Vec<PlotGeometry>,
    pub crs: Option<CRS>,
}

impl PlotCollection {
    /// Load plots from a GeoJSON file, or a Shapefile with the `gdal` feature
    pub fn load<P: AsRef<Path>>(
        path: P,
        plot_id_field: &str,
        treatment_id_field: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let collection = match ext.as_deref() {
            Some("geojson") | Some("json") => {
                let text = std::fs::read_to_string(path)?;
                Self::from_geojson_str(&text, plot_id_field, treatment_id_field).map_err(|e| {
                    match e {
                        Error::Other(reason) => Error::Vector {
                            path: path.to_path_buf(),
                            reason,
                        },
                        other => other,
                    }
                })?
            }
            #[cfg(feature = "gdal")]
            _ => gdal_vector::read_plots(path, plot_id_field, treatment_id_field)?,
            #[cfg(not(feature = "gdal"))]
            _ => {
                return Err(Error::Vector {
                    path: path.to_path_buf(),
                    reason: "only GeoJSON is supported without the `gdal` feature".into(),
                })
            }
        };

        tracing::debug!(
            path = %path.display(),
            plots = collection.len(),
            crs = ?collection.crs.as_ref().map(CRS::identifier),
            "loaded plots"
        );
        Ok(collection)
    }

    /// Parse a GeoJSON FeatureCollection.
    ///
    /// The plot id attribute may be a string or a number and is stored as a
    /// string. Features whose geometry is not a (multi)polygon are kept with
    /// `geometry: None` so they fail individually later.
    pub fn from_geojson_str(
        text: &str,
        plot_id_field: &str,
        treatment_id_field: Option<&str>,
    ) -> Result<Self> {
        let doc: Value =
            serde_json::from_str(text).map_err(|e| Error::Other(format!("invalid JSON: {}", e)))?;

        let features = doc
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Other("not a GeoJSON FeatureCollection".into()))?;

        let crs = doc
            .pointer("/crs/properties/name")
            .and_then(Value::as_str)
            .map(CRS::parse);

        let mut seen = HashSet::new();
        let mut plots = Vec::with_capacity(features.len());
        for (i, feature) in features.iter().enumerate() {
            let properties = feature.get("properties");
            let plot_id = properties
                .and_then(|p| p.get(plot_id_field))
                .and_then(attribute_string)
                .ok_or_else(|| Error::MissingPlotId {
                    feature: i,
                    field: plot_id_field.to_string(),
                })?;
            let treatment_id = treatment_id_field
                .and_then(|field| properties.and_then(|p| p.get(field)))
                .and_then(attribute_string);

            if !seen.insert(plot_id.clone()) {
                tracing::warn!(plot_id = %plot_id, "duplicate plot id in vector source");
            }

            plots.push(PlotGeometry {
                plot_id,
                geometry: feature.get("geometry").and_then(parse_geometry),
                treatment_id,
            });
        }

        Ok(Self { plots, crs })
    }

    pub fn len(&self) -> usize {
        self.plots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlotGeometry> {
        self.plots.iter()
    }

    pub fn get(&self, plot_id: &str) -> Option<&PlotGeometry> {
        self.plots.iter().find(|p| p.plot_id == plot_id)
    }
}

fn attribute_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_geometry(geometry: &Value) -> Option<MultiPolygon<f64>> {
    let coordinates = geometry.get("coordinates")?;
    match geometry.get("type")?.as_str()? {
        "Polygon" => Some(MultiPolygon(vec![parse_polygon(coordinates)?])),
        "MultiPolygon" => coordinates
            .as_array()?
            .iter()
            .map(parse_polygon)
            .collect::<Option<Vec<_>>>()
            .map(MultiPolygon),
        _ => None,
    }
}

fn parse_polygon(rings: &Value) -> Option<Polygon<f64>> {
    let mut rings = rings
        .as_array()?
        .iter()
        .map(parse_ring)
        .collect::<Option<Vec<_>>>()?
        .into_iter();
    let exterior = rings.next().unwrap_or_else(|| LineString(Vec::new()));
    Some(Polygon::new(exterior, rings.collect()))
}

fn parse_ring(ring: &Value) -> Option<LineString<f64>> {
    ring.as_array()?
        .iter()
        .map(|pos| {
            let pos = pos.as_array()?;
            Some(Coord {
                x: pos.first()?.as_f64()?,
                y: pos.get(1)?.as_f64()?,
            })
        })
        .collect::<Option<Vec<_>>>()
        .map(LineString)
}

#[cfg(feature = "gdal")]
mod gdal_vector {
    use super::{PlotCollection, PlotGeometry};
    use crate::crs::CRS;
    use crate::error::{Error, Result};
    use gdal::vector::LayerAccess;
    use gdal::Dataset;
    use geo_types::{Geometry, MultiPolygon};
    use std::path::Path;

    pub(super) fn read_plots(
        path: &Path,
        plot_id_field: &str,
        treatment_id_field: Option<&str>,
    ) -> Result<PlotCollection> {
        let dataset = Dataset::open(path)?;
        let mut layer = dataset.layer(0)?;
        let crs = layer
            .spatial_ref()
            .and_then(|srs| srs.auth_code().ok())
            .map(|code| CRS::from_epsg(code as u32));

        let mut plots = Vec::new();
        for (i, feature) in layer.features().enumerate() {
            let plot_id = feature
                .field_as_string_by_name(plot_id_field)?
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| Error::MissingPlotId {
                    feature: i,
                    field: plot_id_field.to_string(),
                })?;
            let treatment_id = match treatment_id_field {
                Some(field) => feature.field_as_string_by_name(field)?,
                None => None,
            };
            let geometry = feature
                .geometry()
                .and_then(|g| g.to_geo().ok())
                .and_then(|g| match g {
                    Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
                    Geometry::MultiPolygon(mp) => Some(mp),
                    _ => None,
                });
            plots.push(PlotGeometry {
                plot_id,
                geometry,
                treatment_id,
            });
        }

        Ok(PlotCollection { plots, crs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::Contains;

    const PLOTS: &str = r#"{
        "type": "FeatureCollection",
        "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::25832"}},
        "features": [
            {"type": "Feature",
             "properties": {"plot": 101, "treatment": "T1"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[2,0],[2,2],[0,2],[0,0]]]}},
            {"type": "Feature",
             "properties": {"plot": "102"},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[4,0],[6,0],[6,2],[4,2],[4,0]]]]}},
            {"type": "Feature",
             "properties": {"plot": "103"},
             "geometry": {"type": "Point", "coordinates": [1, 1]}}
        ]
    }"#;

    #[test]
    fn test_parse_feature_collection() {
        let plots = PlotCollection::from_geojson_str(PLOTS, "plot", Some("treatment")).unwrap();
        assert_eq!(plots.len(), 3);
        assert_eq!(plots.crs.as_ref().and_then(CRS::epsg), Some(25832));

        let first = plots.get("101").unwrap();
        assert_eq!(first.treatment_id.as_deref(), Some("T1"));
        assert_relative_eq!(first.validated().unwrap().unsigned_area(), 4.0);

        assert!(plots.get("102").unwrap().validated().is_ok());
        assert!(matches!(
            plots.get("103").unwrap().validated(),
            Err(Error::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_missing_plot_id_field() {
        let err = PlotCollection::from_geojson_str(PLOTS, "plot_nr", None).unwrap_err();
        assert!(matches!(err, Error::MissingPlotId { feature: 0, .. }));
    }

    #[test]
    fn test_degenerate_geometry() {
        let flat = PlotGeometry::new(
            "x",
            MultiPolygon(vec![Polygon::new(
                LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (0.0, 0.0)]),
                vec![],
            )]),
        );
        assert!(flat.validated().is_err());

        let empty = PlotGeometry::new("y", MultiPolygon(vec![]));
        assert!(empty.validated().is_err());
    }

    #[test]
    fn test_representative_point_inside() {
        let plots = PlotCollection::from_geojson_str(PLOTS, "plot", None).unwrap();
        let plot = plots.get("102").unwrap();
        let point = plot.representative_point().unwrap();
        assert!(plot.geometry.as_ref().unwrap().contains(&point));
    }
}
