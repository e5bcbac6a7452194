//! Geometry normalization and in-process spatial predicates.
//!
//! Accepted input formats: GeoJSON geometry or feature (object or string),
//! WKT, EWKT with an embedded `SRID=` tag, and `[lng, lat]` coordinate pairs.
//! Everything is normalized to the canonical stored projection (EPSG:3857,
//! spherical web mercator). Untagged runtime inputs (resource ingest, context
//! values) are read as EPSG:4326 lon/lat; untagged rule literals are read as
//! already-canonical; the compiler applies that default itself.
//!
//! Only EPSG:4326 and EPSG:3857 are understood; other projection identifiers
//! are rejected at the boundary rather than silently misread.

use geo::{Contains, CoordsIter, EuclideanDistance, Intersects, LinesIter, MapCoords, Relate};
use geo_types::{Coord, Geometry, Point};
use serde_json::Value;
use wkt::{ToWkt, TryFromWkt};

use crate::authz::errors::AuthzError;

/// EPSG code of the canonical stored projection.
pub const CANONICAL_SRID: i32 = 3857;

/// EPSG code assumed for untagged runtime inputs.
pub const WGS84_SRID: i32 = 4326;

const EARTH_RADIUS_M: f64 = 6_378_137.0;
const MERCATOR_MAX: f64 = std::f64::consts::PI * EARTH_RADIUS_M;

// ─── Literal classification (compile time) ──────────────────────────────

/// How a rule literal should be reconstructed inside the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiteralKind {
    /// GeoJSON text; `srid` from an embedded named CRS, else 4326.
    GeoJson { srid: i32 },
    /// EWKT text with its embedded SRID.
    Ewkt { srid: i32 },
    /// Bare WKT, assumed to be in the canonical projection.
    Wkt,
}

/// Classify a geometry literal and return the text to bind for it.
/// Objects are rendered with sorted keys, so classification is deterministic.
pub fn classify_literal(val: &Value) -> Result<(LiteralKind, String), AuthzError> {
    match val {
        Value::Object(_) => {
            let srid = geojson_srid(val).unwrap_or(WGS84_SRID);
            let text = serde_json::to_string(val)
                .map_err(|e| AuthzError::InvalidPolicy(format!("unserializable geometry: {e}")))?;
            Ok((LiteralKind::GeoJson { srid }, text))
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('{') {
                let parsed: Value = serde_json::from_str(trimmed).map_err(|e| {
                    AuthzError::InvalidPolicy(format!("invalid GeoJSON literal: {e}"))
                })?;
                let srid = geojson_srid(&parsed).unwrap_or(WGS84_SRID);
                Ok((LiteralKind::GeoJson { srid }, trimmed.to_string()))
            } else if trimmed.len() >= 5 && trimmed[..5].eq_ignore_ascii_case("srid=") {
                let (srid, _) = split_ewkt(trimmed)?;
                Ok((LiteralKind::Ewkt { srid }, trimmed.to_string()))
            } else {
                Ok((LiteralKind::Wkt, trimmed.to_string()))
            }
        }
        other => Err(AuthzError::InvalidPolicy(format!(
            "geometry literal must be a string or GeoJSON object, got {other}"
        ))),
    }
}

// ─── Parsing ────────────────────────────────────────────────────────────

/// Parse a geometry from any accepted format and normalize it to the
/// canonical projection. `default_srid` applies when the input carries no
/// projection tag of its own; `None` means WGS84 lon/lat.
pub fn parse_value(val: &Value, default_srid: Option<i32>) -> Result<Geometry<f64>, AuthzError> {
    match val {
        Value::String(s) => parse_text(s, default_srid),
        Value::Object(_) => {
            let srid = geojson_srid(val)
                .or(default_srid)
                .unwrap_or(WGS84_SRID);
            let geom = geojson_to_geometry(val)?;
            to_canonical(geom, srid)
        }
        Value::Array(items) if items.len() >= 2 => {
            let lng = items[0].as_f64().ok_or_else(|| invalid("coordinate pair"))?;
            let lat = items[1].as_f64().ok_or_else(|| invalid("coordinate pair"))?;
            to_canonical(
                Geometry::Point(Point::new(lng, lat)),
                default_srid.unwrap_or(WGS84_SRID),
            )
        }
        other => Err(AuthzError::InvalidPolicy(format!(
            "cannot detect geometry format of {other}"
        ))),
    }
}

/// Parse a geometry from text (WKT, EWKT or GeoJSON).
pub fn parse_text(text: &str, default_srid: Option<i32>) -> Result<Geometry<f64>, AuthzError> {
    let trimmed = text.trim().trim_matches('"').trim();
    if trimmed.is_empty() {
        return Err(invalid("empty geometry"));
    }

    if trimmed.starts_with('{') {
        let parsed: Value = serde_json::from_str(trimmed)
            .map_err(|e| AuthzError::InvalidPolicy(format!("invalid GeoJSON: {e}")))?;
        let srid = geojson_srid(&parsed)
            .or(default_srid)
            .unwrap_or(WGS84_SRID);
        let geom = geojson_to_geometry(&parsed)?;
        return to_canonical(geom, srid);
    }

    if trimmed.len() >= 5 && trimmed[..5].eq_ignore_ascii_case("srid=") {
        let (srid, wkt_part) = split_ewkt(trimmed)?;
        let geom = Geometry::try_from_wkt_str(wkt_part)
            .map_err(|e| AuthzError::InvalidPolicy(format!("invalid WKT in EWKT: {e}")))?;
        return to_canonical(geom, srid);
    }

    let geom = Geometry::try_from_wkt_str(trimmed)
        .map_err(|e| AuthzError::InvalidPolicy(format!("invalid WKT: {e}")))?;
    to_canonical(geom, default_srid.unwrap_or(WGS84_SRID))
}

/// Parse a rule literal with the compiler's projection defaults: untagged WKT
/// is already-canonical, GeoJSON without a CRS member is WGS84, EWKT carries
/// its own tag.
pub fn parse_rule_literal(val: &Value) -> Result<Geometry<f64>, AuthzError> {
    let (kind, text) = classify_literal(val)?;
    match kind {
        LiteralKind::Wkt => parse_text(&text, Some(CANONICAL_SRID)),
        _ => parse_text(&text, None),
    }
}

/// Canonical EWKT rendering for storage.
pub fn to_ewkt(geom: &Geometry<f64>) -> String {
    format!("SRID={CANONICAL_SRID};{}", geom.wkt_string())
}

fn split_ewkt(ewkt: &str) -> Result<(i32, &str), AuthzError> {
    let (srid_part, wkt_part) = ewkt
        .split_once(';')
        .ok_or_else(|| invalid("EWKT missing `;` separator"))?;
    let srid: i32 = srid_part[5..]
        .trim()
        .parse()
        .map_err(|_| invalid("EWKT SRID tag"))?;
    Ok((srid, wkt_part))
}

fn geojson_to_geometry(val: &Value) -> Result<Geometry<f64>, AuthzError> {
    // A Feature wraps its geometry; a bare geometry stands alone.
    let geom_val = if val.get("type") == Some(&Value::String("Feature".into())) {
        val.get("geometry").ok_or_else(|| invalid("feature without geometry"))?
    } else {
        val
    };
    let gj: geojson::Geometry = serde_json::from_value(geom_val.clone())
        .map_err(|e| AuthzError::InvalidPolicy(format!("invalid GeoJSON geometry: {e}")))?;
    Geometry::<f64>::try_from(gj.value)
        .map_err(|e| AuthzError::InvalidPolicy(format!("unsupported GeoJSON geometry: {e}")))
}

/// Extract an EPSG code from a (legacy) GeoJSON named CRS member.
fn geojson_srid(val: &Value) -> Option<i32> {
    let name = val.get("crs")?.get("properties")?.get("name")?.as_str()?;
    let upper = name.to_ascii_uppercase();
    if let Some(code) = upper.strip_prefix("EPSG:") {
        return code.parse().ok();
    }
    if let Some(code) = upper.strip_prefix("URN:OGC:DEF:CRS:EPSG::") {
        return code.parse().ok();
    }
    None
}

fn invalid(what: &str) -> AuthzError {
    AuthzError::InvalidPolicy(format!("invalid geometry input: {what}"))
}

// ─── Projection ─────────────────────────────────────────────────────────

fn to_canonical(geom: Geometry<f64>, srid: i32) -> Result<Geometry<f64>, AuthzError> {
    match srid {
        CANONICAL_SRID => Ok(geom),
        WGS84_SRID => Ok(geom.map_coords(wgs84_to_mercator)),
        other => Err(AuthzError::InvalidPolicy(format!(
            "unsupported projection EPSG:{other}; only EPSG:{WGS84_SRID} and EPSG:{CANONICAL_SRID} are accepted"
        ))),
    }
}

fn wgs84_to_mercator(c: Coord<f64>) -> Coord<f64> {
    let x = c.x * MERCATOR_MAX / 180.0;
    // Clamp latitude away from the poles where the projection diverges.
    let lat = c.y.clamp(-85.06, 85.06);
    let y = ((90.0 + lat) * std::f64::consts::PI / 360.0).tan().ln() * EARTH_RADIUS_M;
    Coord { x, y }
}

// ─── Spatial predicates (residual evaluation) ───────────────────────────

/// `ST_DWithin` equivalent: both geometries in the canonical projection,
/// distance in meters.
pub fn dwithin(a: &Geometry<f64>, b: &Geometry<f64>, distance: f64) -> bool {
    if a.intersects(b) {
        return true;
    }
    min_distance(a, b) <= distance
}

pub fn contains(a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    a.contains(b)
}

pub fn within(a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    b.contains(a)
}

pub fn intersects(a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    a.intersects(b)
}

pub fn covers(a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    a.relate(b).is_covers()
}

/// Minimum euclidean distance between two non-intersecting geometries. The
/// minimum lies at a vertex of one side against a segment (or vertex) of the
/// other, so scanning both directions is exact.
/// `LinesIter` is implemented per-variant in `geo`, not on the `Geometry`
/// enum itself, so dispatch across variants (recursing into collections).
fn geometry_lines(geom: &Geometry<f64>) -> Vec<geo_types::Line<f64>> {
    match geom {
        Geometry::Point(_) | Geometry::MultiPoint(_) => Vec::new(),
        Geometry::Line(g) => g.lines_iter().collect(),
        Geometry::LineString(g) => g.lines_iter().collect(),
        Geometry::Polygon(g) => g.lines_iter().collect(),
        Geometry::MultiLineString(g) => g.lines_iter().collect(),
        Geometry::MultiPolygon(g) => g.lines_iter().collect(),
        Geometry::Rect(g) => g.lines_iter().collect(),
        Geometry::Triangle(g) => g.lines_iter().collect(),
        Geometry::GeometryCollection(g) => g.iter().flat_map(geometry_lines).collect(),
    }
}

fn min_distance(a: &Geometry<f64>, b: &Geometry<f64>) -> f64 {
    let mut best = f64::INFINITY;
    let a_lines = geometry_lines(a);
    let b_lines = geometry_lines(b);

    for coord in a.coords_iter() {
        let p = Point::from(coord);
        for line in &b_lines {
            best = best.min(line.euclidean_distance(&p));
        }
        for other in b.coords_iter() {
            best = best.min(p.euclidean_distance(&Point::from(other)));
        }
    }
    for coord in b.coords_iter() {
        let p = Point::from(coord);
        for line in &a_lines {
            best = best.min(line.euclidean_distance(&p));
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wkt_point_defaults_to_wgs84() {
        let geom = parse_text("POINT(23.7275 37.9838)", None).unwrap();
        match geom {
            Geometry::Point(p) => {
                // Transformed to web mercator meters.
                assert!((p.x() - 2_641_331.0).abs() < 1_000.0);
                assert!(p.y() > 4_000_000.0);
            }
            _ => panic!("expected point"),
        }
    }

    #[test]
    fn test_parse_ewkt_canonical_is_untouched() {
        let geom = parse_text("SRID=3857;POINT(100 200)", None).unwrap();
        match geom {
            Geometry::Point(p) => {
                assert_eq!(p.x(), 100.0);
                assert_eq!(p.y(), 200.0);
            }
            _ => panic!("expected point"),
        }
    }

    #[test]
    fn test_parse_geojson_object() {
        let geom = parse_value(
            &json!({ "type": "Point", "coordinates": [0.0, 0.0] }),
            None,
        )
        .unwrap();
        match geom {
            Geometry::Point(p) => {
                assert!(p.x().abs() < 1e-6);
                assert!(p.y().abs() < 1e-6);
            }
            _ => panic!("expected point"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_projection() {
        let err = parse_text("SRID=2100;POINT(0 0)", None).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_classify_literal_kinds() {
        let (kind, _) = classify_literal(&json!("POINT(1 2)")).unwrap();
        assert_eq!(kind, LiteralKind::Wkt);

        let (kind, _) = classify_literal(&json!("SRID=3857;POINT(1 2)")).unwrap();
        assert_eq!(kind, LiteralKind::Ewkt { srid: 3857 });

        let (kind, _) = classify_literal(&json!("SRID=4326;POINT(1 2)")).unwrap();
        assert_eq!(kind, LiteralKind::Ewkt { srid: 4326 });

        let (kind, _) =
            classify_literal(&json!({ "type": "Point", "coordinates": [1.0, 2.0] })).unwrap();
        assert_eq!(kind, LiteralKind::GeoJson { srid: 4326 });
    }

    #[test]
    fn test_dwithin_same_point() {
        let a = parse_text("POINT(23.7275 37.9838)", None).unwrap();
        let b = parse_text("POINT(23.7275 37.9838)", None).unwrap();
        assert!(dwithin(&a, &b, 5000.0));
    }

    #[test]
    fn test_dwithin_far_point() {
        let a = parse_text("POINT(23.7275 37.9838)", None).unwrap();
        let b = parse_text("POINT(0 0)", None).unwrap();
        assert!(!dwithin(&a, &b, 5000.0));
    }

    #[test]
    fn test_contains_point_in_polygon() {
        let poly = parse_text(
            "SRID=3857;POLYGON((0 0, 10 0, 10 10, 0 10, 0 0))",
            None,
        )
        .unwrap();
        let inside = parse_text("SRID=3857;POINT(5 5)", None).unwrap();
        let outside = parse_text("SRID=3857;POINT(50 50)", None).unwrap();
        assert!(contains(&poly, &inside));
        assert!(!contains(&poly, &outside));
        assert!(within(&inside, &poly));
        assert!(intersects(&poly, &inside));
    }

    #[test]
    fn test_covers_boundary_point() {
        // A boundary point is covered but not contained.
        let poly = parse_text(
            "SRID=3857;POLYGON((0 0, 10 0, 10 10, 0 10, 0 0))",
            None,
        )
        .unwrap();
        let edge = parse_text("SRID=3857;POINT(0 5)", None).unwrap();
        assert!(covers(&poly, &edge));
        assert!(!contains(&poly, &edge));
    }

    #[test]
    fn test_to_ewkt_roundtrip() {
        let geom = parse_text("SRID=3857;POINT(100 200)", None).unwrap();
        let ewkt = to_ewkt(&geom);
        assert!(ewkt.starts_with("SRID=3857;POINT"));
        let back = parse_text(&ewkt, None).unwrap();
        assert_eq!(back, geom);
    }
}
