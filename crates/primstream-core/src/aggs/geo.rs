//! Geographic engine shared by `geo_bounds` and `geo_centroid`.
//!
//! Points come either from one field (`"lat,lon"` string, `[lon, lat]`
//! array or `{"lat": .., "lon": ..}` object) or from a pair of separate
//! latitude and longitude fields. The centroid is the mean of the points
//! projected onto the unit sphere.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};

use super::Engine;
use crate::access::{as_f64, as_string, FieldPath, Lookup};

#[derive(Debug, Clone, PartialEq)]
pub enum GeoSource {
    Point(FieldPath),
    LatLon { lat: FieldPath, lon: FieldPath },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoEngine {
    source: GeoSource,
    missing: Option<Value>,

    pub count: u64,
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,

    // unit-sphere sums
    x: f64,
    y: f64,
    z: f64,
}

impl GeoEngine {
    pub fn new(source: GeoSource, missing: Option<Value>) -> Self {
        Self {
            source,
            missing,
            count: 0,
            top: 0.0,
            left: 0.0,
            bottom: 0.0,
            right: 0.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    pub fn add_point(&mut self, p: Point) {
        if self.count == 0 {
            self.top = p.lat;
            self.bottom = p.lat;
            self.left = p.lon;
            self.right = p.lon;
        } else {
            self.top = self.top.max(p.lat);
            self.bottom = self.bottom.min(p.lat);
            self.left = self.left.min(p.lon);
            self.right = self.right.max(p.lon);
        }

        let (lat, lon) = (p.lat.to_radians(), p.lon.to_radians());
        self.x += lat.cos() * lon.cos();
        self.y += lat.cos() * lon.sin();
        self.z += lat.sin();
        self.count += 1;
    }

    pub fn merge_engine(&mut self, other: &GeoEngine) {
        self.merge_parts(
            other.count,
            [other.top, other.left, other.bottom, other.right],
            [other.x, other.y, other.z],
        );
    }

    fn merge_parts(&mut self, count: u64, bounds: [f64; 4], sums: [f64; 3]) {
        if count == 0 {
            return;
        }
        let [top, left, bottom, right] = bounds;
        if self.count == 0 {
            self.top = top;
            self.left = left;
            self.bottom = bottom;
            self.right = right;
        } else {
            self.top = self.top.max(top);
            self.left = self.left.min(left);
            self.bottom = self.bottom.min(bottom);
            self.right = self.right.max(right);
        }
        self.x += sums[0];
        self.y += sums[1];
        self.z += sums[2];
        self.count += count;
    }

    /// Mean point converted back to latitude/longitude degrees.
    pub fn centroid(&self) -> Option<Point> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let (x, y, z) = (self.x / n, self.y / n, self.z / n);
        let lon = y.atan2(x);
        let lat = z.atan2((x * x + y * y).sqrt());
        Some(Point {
            lat: lat.to_degrees(),
            lon: lon.to_degrees(),
        })
    }

    fn lookup(&self, path: &FieldPath, data: &Value) -> Result<Option<Value>> {
        match path.get(data)? {
            Lookup::Found(Value::Null) | Lookup::Missing => Ok(None),
            Lookup::Found(v) => Ok(Some(v.clone())),
        }
    }

    fn extract(&self, data: &Value) -> Result<Option<Point>> {
        match &self.source {
            GeoSource::Point(path) => match self.lookup(path, data)? {
                Some(v) => parse_point(&v).map(Some),
                None => self.missing.as_ref().map(parse_point).transpose(),
            },
            GeoSource::LatLon { lat, lon } => {
                let lat = self.lookup(lat, data)?;
                let lon = self.lookup(lon, data)?;
                match (lat, lon) {
                    (Some(lat), Some(lon)) => Ok(Some(Point {
                        lat: as_f64(&lat)?,
                        lon: as_f64(&lon)?,
                    })),
                    _ => self.missing.as_ref().map(parse_point).transpose(),
                }
            }
        }
    }
}

/// Reads a point from a `"lat,lon"` string, a `[lon, lat]` array or a
/// `{"lat", "lon"}` object.
pub fn parse_point(value: &Value) -> Result<Point> {
    match value {
        Value::String(s) => {
            let Some((lat, lon)) = s.split_once(',') else {
                bail!("failed to parse {:?} as a geo point", s);
            };
            Ok(Point {
                lat: lat.trim().parse().map_err(|_| anyhow!("bad latitude in {:?}", s))?,
                lon: lon.trim().parse().map_err(|_| anyhow!("bad longitude in {:?}", s))?,
            })
        }
        Value::Array(items) if items.len() == 2 => Ok(Point {
            lon: as_f64(&items[0])?,
            lat: as_f64(&items[1])?,
        }),
        Value::Object(map) => {
            let lat = map.get("lat").ok_or_else(|| anyhow!("no \"lat\" in geo point"))?;
            let lon = map.get("lon").ok_or_else(|| anyhow!("no \"lon\" in geo point"))?;
            Ok(Point {
                lat: as_f64(lat)?,
                lon: as_f64(lon)?,
            })
        }
        other => bail!("{} is not a geo point", other),
    }
}

impl Engine for GeoEngine {
    fn name(&self) -> String {
        let mut name = match &self.source {
            GeoSource::Point(path) => format!("geo.{}", path),
            GeoSource::LatLon { lat, lon } => format!("geo.lat:{}/lon:{}", lat, lon),
        };
        if let Some(missing) = &self.missing {
            name.push('/');
            name.push_str(&as_string(missing).unwrap_or_else(|_| missing.to_string()));
        }
        name
    }

    fn add(&mut self, data: &Value) -> Result<()> {
        if let Some(point) = self.extract(data)? {
            self.add_point(point);
        }
        Ok(())
    }

    fn merge_json(&mut self, data: &Value) -> Result<()> {
        let map = data.as_object().ok_or_else(|| anyhow!("no valid geo data"))?;
        let get = |key: &str| -> Result<f64> {
            map.get(key)
                .ok_or_else(|| anyhow!("no {:?} field in intermediate geo", key))
                .and_then(as_f64)
        };

        let count = get("count")? as u64;
        if count == 0 {
            return Ok(());
        }
        self.merge_parts(
            count,
            [get("top")?, get("left")?, get("bottom")?, get("right")?],
            [get("x")?, get("y")?, get("z")?],
        );
        Ok(())
    }

    fn to_json(&self) -> Value {
        json!({
            "count": self.count,
            "top": self.top,
            "left": self.left,
            "bottom": self.bottom,
            "right": self.right,
            "x": self.x,
            "y": self.y,
            "z": self.z,
        })
    }
}

pub(crate) fn bounds_json(g: &GeoEngine) -> Value {
    if g.count == 0 {
        return json!({ "bounds": null });
    }
    json!({
        "bounds": {
            "top_left": { "lat": g.top, "lon": g.left },
            "bottom_right": { "lat": g.bottom, "lon": g.right },
        }
    })
}

pub(crate) fn centroid_json(g: &GeoEngine) -> Value {
    match g.centroid() {
        Some(c) => json!({
            "centroid": {
                "count": g.count,
                "location": { "lat": c.lat, "lon": c.lon },
            }
        }),
        None => json!({ "centroid": { "count": 0, "location": null } }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_engine() -> GeoEngine {
        GeoEngine::new(GeoSource::Point(FieldPath::parse("loc").unwrap()), None)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn point_formats() {
        let p = parse_point(&json!("41.12, -71.34")).unwrap();
        assert_eq!(p, Point { lat: 41.12, lon: -71.34 });
        let p = parse_point(&json!([-71.34, 41.12])).unwrap();
        assert_eq!(p, Point { lat: 41.12, lon: -71.34 });
        let p = parse_point(&json!({"lat": "41.12", "lon": -71.34})).unwrap();
        assert_eq!(p, Point { lat: 41.12, lon: -71.34 });
        assert!(parse_point(&json!("41.12")).is_err());
        assert!(parse_point(&json!(5)).is_err());
    }

    #[test]
    fn bounds_and_centroid() {
        let mut g = point_engine();
        for loc in ["10,20", "-10,40", "0,30"] {
            g.add(&json!({ "loc": loc })).unwrap();
        }
        g.add(&json!({ "other": 1 })).unwrap();

        let b = bounds_json(&g);
        assert_eq!(b["bounds"]["top_left"], json!({"lat": 10.0, "lon": 20.0}));
        assert_eq!(b["bounds"]["bottom_right"], json!({"lat": -10.0, "lon": 40.0}));

        let c = g.centroid().unwrap();
        assert!(close(c.lat, 0.0));
        assert!(close(c.lon, 30.0));
        assert_eq!(centroid_json(&g)["centroid"]["count"], json!(3));
    }

    #[test]
    fn lat_lon_fields() {
        let mut g = GeoEngine::new(
            GeoSource::LatLon {
                lat: FieldPath::parse("pos.lat").unwrap(),
                lon: FieldPath::parse("pos.lon").unwrap(),
            },
            None,
        );
        g.add(&json!({"pos": {"lat": 1.0, "lon": 2.0}})).unwrap();
        g.add(&json!({"pos": {"lat": 1.0}})).unwrap();
        assert_eq!(g.count, 1);
        assert_eq!(g.name(), "geo.lat:pos.lat/lon:pos.lon");
    }

    #[test]
    fn merge_matches_union() {
        let mut a = point_engine();
        let mut b = point_engine();
        a.add_point(Point { lat: 50.0, lon: 10.0 });
        b.add_point(Point { lat: -5.0, lon: 100.0 });
        b.add_point(Point { lat: 20.0, lon: -30.0 });

        let mut native = a.clone();
        native.merge_engine(&b);
        let mut from_json = a.clone();
        from_json.merge_json(&b.to_json()).unwrap();

        assert_eq!(native, from_json);
        assert_eq!(native.count, 3);
        assert_eq!(native.top, 50.0);
        assert_eq!(native.left, -30.0);
        assert_eq!(native.bottom, -5.0);
        assert_eq!(native.right, 100.0);
    }
}
