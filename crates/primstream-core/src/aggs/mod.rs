//! Aggregation sets.
//!
//! Options arrive as `{ name: { type: { options } } }`. Every name becomes a
//! *function* (what the caller sees) backed by an *engine* (the mergeable
//! state). Functions over the same field share one engine, so `sum` and
//! `avg` on `price` are computed once. Engines are deduplicated by
//! [`Engine::name`].
//!
//! ```text
//! {"total": {"sum": {"field": "price"}},
//!  "mean":  {"avg": {"field": "price"}}}     -> one engine "stat.price"
//! ```
//!
//! `to_json(true)` renders the functions. `to_json(false)` renders the raw
//! engine state keyed by engine name, which is what workers and cluster
//! nodes exchange and what [`Aggregations::merge`] consumes.

pub mod datehist;
pub mod geo;
pub mod stat;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::access::{as_f64, as_string, FieldPath};
use crate::datetime::{Interval, Zone};
use datehist::{DateHistEngine, DEFAULT_KEY_FORMAT};
use geo::{GeoEngine, GeoSource};
use stat::{StatEngine, STAT_MAX, STAT_MIN, STAT_SUM, STAT_SUM2};

/// Key for nested aggregations inside a bucket aggregation.
pub const AGGS_NAME: &str = "aggs";

/// Mergeable aggregation state.
pub trait Engine {
    /// Deterministic identity. Equal names mean interchangeable engines.
    fn name(&self) -> String;

    /// Adds one parsed record.
    fn add(&mut self, data: &Value) -> Result<()>;

    /// Merges intermediate state produced by [`Engine::to_json`].
    fn merge_json(&mut self, data: &Value) -> Result<()>;

    /// Intermediate state.
    fn to_json(&self) -> Value;
}

#[derive(Debug, Clone)]
pub enum AnyEngine {
    Stat(StatEngine),
    Geo(GeoEngine),
    DateHist(DateHistEngine),
}

impl AnyEngine {
    fn inner(&self) -> &dyn Engine {
        match self {
            AnyEngine::Stat(e) => e,
            AnyEngine::Geo(e) => e,
            AnyEngine::DateHist(e) => e,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Engine {
        match self {
            AnyEngine::Stat(e) => e,
            AnyEngine::Geo(e) => e,
            AnyEngine::DateHist(e) => e,
        }
    }

    pub fn name(&self) -> String {
        self.inner().name()
    }

    pub fn add(&mut self, data: &Value) -> Result<()> {
        self.inner_mut().add(data)
    }

    pub fn merge_json(&mut self, data: &Value) -> Result<()> {
        self.inner_mut().merge_json(data)
    }

    pub fn to_json(&self) -> Value {
        self.inner().to_json()
    }

    /// Merges an engine of the same kind, e.g. a worker's clone.
    pub fn merge(&mut self, other: &AnyEngine) -> Result<()> {
        match (self, other) {
            (AnyEngine::Stat(a), AnyEngine::Stat(b)) => a.merge_engine(b),
            (AnyEngine::Geo(a), AnyEngine::Geo(b)) => a.merge_engine(b),
            (AnyEngine::DateHist(a), AnyEngine::DateHist(b)) => a.merge_engine(b)?,
            (a, b) => bail!("cannot merge {} into {}", b.name(), a.name()),
        }
        Ok(())
    }

    pub fn as_stat(&self) -> Option<&StatEngine> {
        match self {
            AnyEngine::Stat(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Sum,
    Min,
    Max,
    Count,
    Avg,
    Stats,
    ExtendedStats { sigma: f64 },
    GeoBounds,
    GeoCentroid,
    DateHistogram { keyed: bool, min_doc_count: u64 },
}

impl Kind {
    fn stat_flags(&self) -> Option<u8> {
        match self {
            Kind::Sum | Kind::Avg => Some(STAT_SUM),
            Kind::Min => Some(STAT_MIN),
            Kind::Max => Some(STAT_MAX),
            Kind::Count => Some(0),
            Kind::Stats => Some(STAT_SUM | STAT_MIN | STAT_MAX),
            Kind::ExtendedStats { .. } => Some(STAT_SUM | STAT_SUM2 | STAT_MIN | STAT_MAX),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Function {
    kind: Kind,
    // position in `Aggregations::engines`
    engine: usize,
}

/// A set of named aggregation functions over shared engines.
#[derive(Debug, Clone)]
pub struct Aggregations {
    functions: BTreeMap<String, Function>,
    engines: Vec<AnyEngine>,
    options: Value,
}

impl Aggregations {
    /// Builds an aggregation set from options. An empty option map yields `None`.
    pub fn from_options(options: &Value) -> Result<Option<Self>> {
        let params = match options {
            Value::Null => return Ok(None),
            Value::Object(map) => map,
            _ => bail!("aggregation options must be an object"),
        };

        let mut aggs = Aggregations {
            functions: BTreeMap::new(),
            engines: Vec::new(),
            options: options.clone(),
        };

        for (name, agg) in params {
            let agg = match agg {
                Value::Object(map) if map.len() == 1 => map,
                _ => bail!("{:?} contains invalid aggregation object", name),
            };
            for (type_name, opts) in agg {
                let empty = Map::new();
                let opts = match opts {
                    Value::Object(map) => map,
                    Value::Null => &empty,
                    _ => bail!("{:?} has invalid {:?} options", name, type_name),
                };
                let function = aggs
                    .make_function(type_name, opts)
                    .with_context(|| format!("failed to create {:?} aggregation", name))?;
                aggs.functions.insert(name.clone(), function);
            }
        }

        if aggs.functions.is_empty() {
            return Ok(None);
        }
        Ok(Some(aggs))
    }

    fn make_function(&mut self, type_name: &str, opts: &Map<String, Value>) -> Result<Function> {
        let kind = parse_kind(type_name, opts)?;
        let missing = opts.get("missing").filter(|v| !v.is_null()).cloned();

        let engine = if let Some(flags) = kind.stat_flags() {
            let field = field_opt("field", opts)?;
            AnyEngine::Stat(StatEngine::new(field, missing, flags))
        } else if matches!(kind, Kind::GeoBounds | Kind::GeoCentroid) {
            let source = if opts.contains_key("field") {
                GeoSource::Point(field_opt("field", opts)?)
            } else {
                GeoSource::LatLon {
                    lat: field_opt("latitude", opts)?,
                    lon: field_opt("longitude", opts)?,
                }
            };
            AnyEngine::Geo(GeoEngine::new(source, missing))
        } else {
            AnyEngine::DateHist(make_date_hist(opts, missing)?)
        };

        Ok(Function {
            kind,
            engine: self.register(engine),
        })
    }

    /// Returns the position of an engine with the same name, adding
    /// `engine` if there is none.
    fn register(&mut self, engine: AnyEngine) -> usize {
        let name = engine.name();
        if let Some(pos) = self.engines.iter().position(|e| e.name() == name) {
            if let (AnyEngine::Stat(existing), AnyEngine::Stat(new)) =
                (&mut self.engines[pos], &engine)
            {
                existing.join_flags(new.flags());
            }
            return pos;
        }
        self.engines.push(engine);
        self.engines.len() - 1
    }

    /// The options this set was built from.
    pub fn options(&self) -> &Value {
        &self.options
    }

    pub fn engines(&self) -> &[AnyEngine] {
        &self.engines
    }

    /// Adds one parsed record to every engine.
    pub fn add(&mut self, data: &Value) -> Result<()> {
        for engine in &mut self.engines {
            engine.add(data)?;
        }
        Ok(())
    }

    /// Merges intermediate state keyed by engine name.
    pub fn merge(&mut self, data: &Value) -> Result<()> {
        let im = data.as_object().ok_or_else(|| anyhow!("data is not a map"))?;
        for engine in &mut self.engines {
            let name = engine.name();
            let Some(state) = im.get(&name) else {
                bail!("intermediate engine {} is missing", name);
            };
            engine
                .merge_json(state)
                .context("failed to merge intermediate aggregation")?;
        }
        Ok(())
    }

    /// Merges a clone of this set, e.g. from a worker thread.
    pub fn merge_from(&mut self, other: &Aggregations) -> Result<()> {
        if self.engines.len() != other.engines.len() {
            bail!("cannot merge aggregations with different engines");
        }
        for (mine, theirs) in self.engines.iter_mut().zip(&other.engines) {
            mine.merge(theirs)?;
        }
        Ok(())
    }

    /// Merges intermediate state into the engine at position `index`.
    pub fn merge_engine(&mut self, index: usize, data: &Value) -> Result<()> {
        let engine = self
            .engines
            .get_mut(index)
            .ok_or_else(|| anyhow!("no engine #{}", index))?;
        engine.merge_json(data)
    }

    /// Field paths of all engines, in engine order, when every engine is a
    /// plain stat without a missing substitute. Otherwise `None`.
    pub fn stat_fields(&self) -> Option<Vec<String>> {
        self.engines
            .iter()
            .map(|e| match e.as_stat() {
                Some(s) if s.missing().is_none() => Some(s.field().as_str().to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn to_json(&self, final_view: bool) -> Value {
        let mut out = Map::new();
        if final_view {
            for (name, f) in &self.functions {
                out.insert(name.clone(), self.function_json(f));
            }
        } else {
            for engine in &self.engines {
                out.insert(engine.name(), engine.to_json());
            }
        }
        Value::Object(out)
    }

    fn function_json(&self, f: &Function) -> Value {
        match (&f.kind, &self.engines[f.engine]) {
            (Kind::Sum, AnyEngine::Stat(s)) => stat::sum_json(s),
            (Kind::Min, AnyEngine::Stat(s)) => stat::min_json(s),
            (Kind::Max, AnyEngine::Stat(s)) => stat::max_json(s),
            (Kind::Count, AnyEngine::Stat(s)) => stat::count_json(s),
            (Kind::Avg, AnyEngine::Stat(s)) => stat::avg_json(s),
            (Kind::Stats, AnyEngine::Stat(s)) => stat::stats_json(s),
            (Kind::ExtendedStats { sigma }, AnyEngine::Stat(s)) => {
                stat::extended_stats_json(s, *sigma)
            }
            (Kind::GeoBounds, AnyEngine::Geo(g)) => geo::bounds_json(g),
            (Kind::GeoCentroid, AnyEngine::Geo(g)) => geo::centroid_json(g),
            (Kind::DateHistogram { keyed, min_doc_count }, AnyEngine::DateHist(h)) => {
                h.function_json(*keyed, *min_doc_count)
            }
            _ => Value::Null,
        }
    }
}

fn parse_kind(type_name: &str, opts: &Map<String, Value>) -> Result<Kind> {
    let kind = match type_name {
        "sum" => Kind::Sum,
        "min" => Kind::Min,
        "max" => Kind::Max,
        "value_count" | "count" => Kind::Count,
        "avg" | "average" => Kind::Avg,
        "stats" => Kind::Stats,
        "extended_stats" | "extended-stats" | "e-stats" => {
            let sigma = match opts.get("sigma") {
                Some(v) => as_f64(v).map_err(|e| anyhow!("bad \"sigma\" option: {}", e))?,
                None => 2.0,
            };
            if sigma < 0.0 {
                bail!("bad \"sigma\" option: cannot be negative");
            }
            Kind::ExtendedStats { sigma }
        }
        "geo_bounds" | "bounds" => Kind::GeoBounds,
        "geo_centroid" | "centroid" => Kind::GeoCentroid,
        "date_histogram" | "date-histogram" | "date_hist" | "date-hist" => {
            let keyed = match opts.get("keyed") {
                Some(Value::Bool(b)) => *b,
                Some(other) => bail!("bad \"keyed\" flag: {} is not a boolean", other),
                None => false,
            };
            let min_doc_count = match opts.get("min_doc_count") {
                Some(v) => {
                    let n = as_f64(v).map_err(|e| anyhow!("bad \"min_doc_count\" option: {}", e))?;
                    if n < 0.0 {
                        bail!("bad \"min_doc_count\" option: cannot be negative");
                    }
                    n as u64
                }
                None => 0,
            };
            Kind::DateHistogram {
                keyed,
                min_doc_count,
            }
        }
        other => bail!("{:?} is unknown aggregation type", other),
    };
    Ok(kind)
}

fn string_opt(name: &str, opts: &Map<String, Value>) -> Result<Option<String>> {
    match opts.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => as_string(v)
            .map(Some)
            .map_err(|e| anyhow!("bad {:?} option found: {}", name, e)),
    }
}

fn field_opt(name: &str, opts: &Map<String, Value>) -> Result<FieldPath> {
    let field = string_opt(name, opts)?.ok_or_else(|| anyhow!("no {:?} option found", name))?;
    FieldPath::parse(&field)
}

fn make_date_hist(opts: &Map<String, Value>, missing: Option<Value>) -> Result<DateHistEngine> {
    let field = field_opt("field", opts)?;

    let interval = string_opt("interval", opts)?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("bad \"interval\": cannot be empty"))?;
    let interval =
        Interval::parse(&interval).map_err(|e| anyhow!("bad \"interval\": {}", e))?;

    let timezone = match string_opt("time_zone", opts)? {
        Some(tz) => Zone::parse(&tz).map_err(|e| anyhow!("bad \"time_zone\": {}", e))?,
        None => Zone::utc(),
    };

    let format = string_opt("format", opts)?.unwrap_or_else(|| DEFAULT_KEY_FORMAT.to_string());

    let offset = match string_opt("offset", opts)? {
        Some(offset) => Interval::parse(&offset)
            .map_err(|e| anyhow!("bad \"offset\": {}", e))?
            .fixed_offset(),
        None => chrono::Duration::zero(),
    };

    let sub_aggs = match opts.get(AGGS_NAME) {
        Some(sub) => Aggregations::from_options(sub).context("failed to parse sub-aggregation")?,
        None => None,
    };

    Ok(DateHistEngine::new(
        field, missing, interval, offset, timezone, format, sub_aggs,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make(options: Value) -> Aggregations {
        Aggregations::from_options(&options).unwrap().unwrap()
    }

    fn populate(aggs: &mut Aggregations, values: &[f64]) {
        for v in values {
            aggs.add(&json!({"foo": {"bar": v}})).unwrap();
        }
    }

    #[test]
    fn functions_share_engines() {
        let aggs = make(json!({
            "a": {"sum": {"field": "foo.bar"}},
            "b": {"avg": {"field": "foo.bar"}},
            "c": {"max": {"field": "foo.bar"}},
            "d": {"max": {"field": "foo.baz"}},
        }));
        assert_eq!(aggs.engines().len(), 2);
        let stat = aggs.engines()[0].as_stat().unwrap();
        assert_eq!(stat.flags(), STAT_SUM | STAT_MAX);
    }

    #[test]
    fn stats_over_mixed_values() {
        let mut aggs = make(json!({"my": {"stats": {"field": "foo.bar"}}}));
        aggs.add(&json!({"foo": {"bar": 100.0}})).unwrap();
        aggs.add(&json!({"foo": {"bar": "200"}})).unwrap();
        aggs.add(&json!({"foo": {"bar": 3e2}})).unwrap();

        let out = aggs.to_json(true);
        assert_eq!(out["my"]["count"], json!(3));
        assert_eq!(out["my"]["sum"].as_f64(), Some(600.0));
        assert_eq!(out["my"]["min"].as_f64(), Some(100.0));
        assert_eq!(out["my"]["max"].as_f64(), Some(300.0));
        assert_eq!(out["my"]["avg"].as_f64(), Some(200.0));
    }

    #[test]
    fn intermediate_round_trip() {
        let options = json!({
            "s": {"extended_stats": {"field": "foo.bar", "sigma": 1}},
            "n": {"count": {"field": "foo.bar"}},
        });
        let mut a = make(options.clone());
        let mut b = make(options.clone());
        populate(&mut a, &[100.0, 200.0]);
        populate(&mut b, &[300.0, 400.0, 500.0]);

        let mut total = make(options);
        total.merge(&a.to_json(false)).unwrap();
        total.merge(&b.to_json(false)).unwrap();

        let out = total.to_json(true);
        assert_eq!(out["n"], json!({"value": 5}));
        assert_eq!(out["s"]["variance"].as_f64(), Some(20000.0));
        assert_eq!(out["s"]["std_deviation"].as_f64(), Some(141.4213562373095));
    }

    #[test]
    fn worker_clones_merge() {
        let mut parent = make(json!({"m": {"min": {"field": "foo.bar"}}}));
        let mut w1 = parent.clone();
        let mut w2 = parent.clone();
        populate(&mut w1, &[5.0, 3.0]);
        populate(&mut w2, &[9.0, 1.0]);
        parent.merge_from(&w1).unwrap();
        parent.merge_from(&w2).unwrap();
        assert_eq!(parent.to_json(true)["m"], json!({"value": 1.0}));
    }

    #[test]
    fn missing_intermediate_engine() {
        let mut aggs = make(json!({"m": {"min": {"field": "foo.bar"}}}));
        let err = aggs.merge(&json!({"stat.other": {"count": 0}})).unwrap_err();
        assert!(err.to_string().contains("intermediate engine stat.foo.bar is missing"));
        assert!(aggs.merge(&json!([1])).is_err());
    }

    #[test]
    fn bad_options() {
        assert!(Aggregations::from_options(&json!({})).unwrap().is_none());
        assert!(Aggregations::from_options(&Value::Null).unwrap().is_none());

        let err = Aggregations::from_options(&json!({"x": {"sum": {}, "max": {}}})).unwrap_err();
        assert!(err.to_string().contains("invalid aggregation object"));

        let err = Aggregations::from_options(&json!({"x": {"median": {"field": "a"}}}))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("unknown aggregation type"));

        let err = Aggregations::from_options(&json!({"x": {"sum": {}}})).unwrap_err();
        assert!(format!("{:#}", err).contains("no \"field\" option found"));

        let err = Aggregations::from_options(&json!({
            "x": {"extended_stats": {"field": "a", "sigma": -1}}
        }))
        .unwrap_err();
        assert!(format!("{:#}", err).contains("bad \"sigma\" option"));
    }

    #[test]
    fn type_aliases() {
        let aggs = make(json!({
            "a": {"average": {"field": "x"}},
            "b": {"e-stats": {"field": "x"}},
            "c": {"bounds": {"field": "loc"}},
            "d": {"date-hist": {"field": "t", "interval": "day"}},
        }));
        assert_eq!(aggs.engines().len(), 3);
        assert!(aggs.stat_fields().is_none());
    }

    #[test]
    fn stat_fields_in_engine_order() {
        let aggs = make(json!({
            "a": {"sum": {"field": "foo"}},
            "b": {"max": {"field": "bar"}},
        }));
        let mut fields = aggs.stat_fields().unwrap();
        fields.sort();
        assert_eq!(fields, vec!["bar".to_string(), "foo".to_string()]);
    }

    #[test]
    fn date_histogram_with_sub_aggs() {
        let mut aggs = make(json!({
            "hist": {"date_histogram": {
                "field": "created",
                "interval": "1h",
                "aggs": {"total": {"sum": {"field": "foo.bar"}}},
            }}
        }));
        for (created, v) in [
            ("2017-11-07T03:15:01Z", 1.0),
            ("2017-11-07T04:15:02Z", 2.0),
            ("2017-11-07T04:35:03Z", 3.0),
        ] {
            aggs.add(&json!({"created": created, "foo": {"bar": v}})).unwrap();
        }

        let name = aggs.engines()[0].name();
        assert!(name.starts_with("datehist.field::created/interval::1h/"));
        assert!(name.ends_with("/sub-aggs<stat.foo.bar>"));

        let out = aggs.to_json(true);
        let buckets = out["hist"]["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[1]["doc_count"], json!(2));
        assert_eq!(buckets[1]["total"]["value"].as_f64(), Some(5.0));

        let mut copy = make(aggs.options().clone());
        copy.merge(&aggs.to_json(false)).unwrap();
        assert_eq!(copy.to_json(true), out);
    }

    #[test]
    fn date_histogram_time_zone() {
        let mut aggs = make(json!({
            "hist": {"date_histogram": {
                "field": "created",
                "interval": "day",
                "time_zone": "Europe/Paris",
                "format": "yyyy-MM-dd ZZ",
            }}
        }));
        // the 29th lasts 25 hours in Paris
        for created in ["2017-10-28T22:30:00Z", "2017-10-29T22:30:00Z", "2017-10-29T23:30:00Z"] {
            aggs.add(&json!({ "created": created })).unwrap();
        }

        let out = aggs.to_json(true);
        let buckets = out["hist"]["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["key_as_string"], "2017-10-29 +02:00");
        assert_eq!(buckets[0]["doc_count"], json!(2));
        assert_eq!(buckets[1]["key_as_string"], "2017-10-30 +01:00");
        assert_eq!(buckets[1]["doc_count"], json!(1));

        let err = Aggregations::from_options(&json!({
            "x": {"date_histogram": {"field": "a", "interval": "1d", "time_zone": "Nowhere/Land"}}
        }))
        .unwrap_err();
        assert!(format!("{:#}", err).contains("bad \"time_zone\""));
    }
}
