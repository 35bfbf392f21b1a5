//! Coordinate Reference System handling

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate Reference System representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CRS {
    /// WKT representation
    wkt: Option<String>,
    /// EPSG code if known
    epsg: Option<u32>,
}

impl CRS {
    /// Create a CRS from an EPSG code
    pub fn from_epsg(code: u32) -> Self {
        Self {
            wkt: None,
            epsg: Some(code),
        }
    }

    /// Create a CRS from a WKT string
    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        Self {
            wkt: Some(wkt.into()),
            epsg: None,
        }
    }

    /// WGS84 geographic CRS (EPSG:4326)
    pub fn wgs84() -> Self {
        Self::from_epsg(4326)
    }

    /// Parse a CRS name as found in GeoJSON `crs` members and config files.
    ///
    /// Understands `EPSG:25832`, `urn:ogc:def:crs:EPSG::25832`,
    /// `urn:ogc:def:crs:OGC:1.3:CRS84` and bare codes. Anything else is kept
    /// as WKT text.
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        let upper = name.to_ascii_uppercase();

        if upper.ends_with("CRS84") {
            return Self::wgs84();
        }
        if let Some(code) = upper
            .rsplit(':')
            .next()
            .filter(|_| upper.contains("EPSG"))
            .and_then(|c| c.parse::<u32>().ok())
        {
            return Self::from_epsg(code);
        }
        match name.parse::<u32>() {
            Ok(code) => Self::from_epsg(code),
            Err(_) => Self::from_wkt(name),
        }
    }

    /// Get EPSG code if known
    pub fn epsg(&self) -> Option<u32> {
        self.epsg
    }

    /// Check if two CRS are equivalent
    pub fn is_equivalent(&self, other: &CRS) -> bool {
        if let (Some(a), Some(b)) = (self.epsg, other.epsg) {
            return a == b;
        }

        // Imperfect: WKT text from different writers can differ for the same CRS.
        if let (Some(a), Some(b)) = (&self.wkt, &other.wkt) {
            return a == b;
        }

        false
    }

    /// Get a string identifier for this CRS
    pub fn identifier(&self) -> String {
        if let Some(code) = self.epsg {
            return format!("EPSG:{}", code);
        }
        if let Some(wkt) = &self.wkt {
            let end = wkt.char_indices().nth(50).map_or(wkt.len(), |(i, _)| i);
            return format!("WKT:{}", &wkt[..end]);
        }
        "Unknown".to_string()
    }
}

impl fmt::Display for CRS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crs_epsg() {
        let crs = CRS::from_epsg(4326);
        assert_eq!(crs.epsg(), Some(4326));
        assert_eq!(crs.identifier(), "EPSG:4326");
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(CRS::parse("EPSG:25832").epsg(), Some(25832));
        assert_eq!(CRS::parse("urn:ogc:def:crs:EPSG::32633").epsg(), Some(32633));
        assert_eq!(CRS::parse("urn:ogc:def:crs:OGC:1.3:CRS84").epsg(), Some(4326));
        assert_eq!(CRS::parse("3857").epsg(), Some(3857));
        assert!(CRS::parse("LOCAL_CS[\"x\"]").epsg().is_none());
    }

    #[test]
    fn test_crs_equivalence() {
        assert!(CRS::from_epsg(4326).is_equivalent(&CRS::wgs84()));
        assert!(!CRS::from_epsg(4326).is_equivalent(&CRS::from_epsg(25832)));
        assert!(!CRS::from_epsg(4326).is_equivalent(&CRS::from_wkt("GEOGCS")));
    }
}
