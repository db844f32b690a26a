//! CSV/JSON loaders for survey samples and the beacon registry, plus the
//! map-spec string parser.
//!
//! Malformed rows are skipped and counted; loading fails only when nothing
//! usable remains.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::{beacon_major_minor, Beacon, BleBeacon, Location, Sample};
use crate::error::LocError;

/// Meters per 3-foot unit used by the short CSV variant.
const THREE_FEET: f64 = 0.9144;

/// Row-level accounting of one load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub parsed: usize,
    pub skipped: usize,
}

/// One floor entry of a map-spec string; image decoding happens outside the
/// engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FloorSpec {
    pub floor: i32,
    pub ppm_x: f64,
    pub ppm_y: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub path: String,
}

/// Long CSV rows: `timestamp, x, y, z, floor, n_beacons, (major, minor, rssi)*`.
pub fn samples_from_csv<R: Read>(reader: R) -> Result<(Vec<Sample>, LoadReport), LocError> {
    read_samples_csv(reader, 1.0)
}

/// Short CSV variant with 3-foot units on x, y, z.
pub fn samples_from_short_csv<R: Read>(reader: R) -> Result<(Vec<Sample>, LoadReport), LocError> {
    read_samples_csv(reader, THREE_FEET)
}

fn read_samples_csv<R: Read>(reader: R, unit: f64) -> Result<(Vec<Sample>, LoadReport), LocError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut samples = Vec::new();
    let mut report = LoadReport::default();
    for (row, record) in csv_reader.records().enumerate() {
        let parsed = record
            .map_err(|e| e.to_string())
            .and_then(|r| parse_sample_record(&r, unit));
        match parsed {
            Ok(sample) => {
                samples.push(sample);
                report.parsed += 1;
            }
            Err(reason) => {
                warn!(row, reason, "skipping sample row");
                report.skipped += 1;
            }
        }
    }
    if samples.is_empty() {
        return Err(LocError::NoValidSample {
            dropped: report.skipped,
        });
    }
    Ok((samples, report))
}

fn parse_sample_record(record: &csv::StringRecord, unit: f64) -> Result<Sample, String> {
    if record.len() < 6 {
        return Err(format!("expected at least 6 fields, got {}", record.len()));
    }
    let field = |i: usize| -> &str { record.get(i).unwrap_or("") };
    let timestamp_ms: u64 = field(0).parse().map_err(|_| "bad timestamp".to_string())?;
    let x: f64 = field(1).parse().map_err(|_| "bad x".to_string())?;
    let y: f64 = field(2).parse().map_err(|_| "bad y".to_string())?;
    let z: f64 = field(3).parse().map_err(|_| "bad z".to_string())?;
    let floor: f64 = field(4).parse().map_err(|_| "bad floor".to_string())?;
    let n_beacons: usize = field(5).parse().map_err(|_| "bad beacon count".to_string())?;
    if record.len() < 6 + 3 * n_beacons {
        return Err("row shorter than its declared beacon count".into());
    }
    let mut beacons = Vec::with_capacity(n_beacons);
    for k in 0..n_beacons {
        let base = 6 + 3 * k;
        let major: u32 = field(base).parse().map_err(|_| "bad major".to_string())?;
        let minor: u32 = field(base + 1).parse().map_err(|_| "bad minor".to_string())?;
        let rssi: f64 = field(base + 2).parse().map_err(|_| "bad rssi".to_string())?;
        beacons.push(Beacon::new(major, minor, rssi));
    }
    Ok(Sample {
        timestamp_ms,
        location: Location::new(x * unit, y * unit, z * unit, floor),
        beacons,
    })
}

/// Re-emit samples in the long CSV layout; `samples_from_csv` of the output
/// reproduces the input list exactly.
pub fn samples_to_csv<W: Write>(writer: W, samples: &[Sample]) -> Result<(), LocError> {
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(writer);
    for sample in samples {
        let mut row = vec![
            sample.timestamp_ms.to_string(),
            sample.location.x.to_string(),
            sample.location.y.to_string(),
            sample.location.z.to_string(),
            sample.location.floor.to_string(),
            sample.beacons.len().to_string(),
        ];
        for beacon in &sample.beacons {
            let (major, minor) = beacon_major_minor(beacon.id);
            row.push(major.to_string());
            row.push(minor.to_string());
            row.push(beacon.rssi.to_string());
        }
        csv_writer
            .write_record(&row)
            .map_err(|e| LocError::Data(e.to_string()))?;
    }
    csv_writer.flush().map_err(|e| LocError::Data(e.to_string()))
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonLocation {
    x: f64,
    y: f64,
    z: f64,
    floor: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonBeacon {
    major: u32,
    minor: u32,
    rssi: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonSample {
    timestamp: u64,
    location: JsonLocation,
    beacons: Vec<JsonBeacon>,
}

/// JSON array variant of the sample format.
pub fn samples_from_json<R: Read>(reader: R) -> Result<(Vec<Sample>, LoadReport), LocError> {
    let entries: Vec<serde_json::Value> =
        serde_json::from_reader(reader).map_err(|e| LocError::Data(e.to_string()))?;

    let mut samples = Vec::new();
    let mut report = LoadReport::default();
    for (row, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<JsonSample>(entry) {
            Ok(parsed) => {
                samples.push(Sample {
                    timestamp_ms: parsed.timestamp,
                    location: Location::new(
                        parsed.location.x,
                        parsed.location.y,
                        parsed.location.z,
                        parsed.location.floor,
                    ),
                    beacons: parsed
                        .beacons
                        .iter()
                        .map(|b| Beacon::new(b.major, b.minor, b.rssi))
                        .collect(),
                });
                report.parsed += 1;
            }
            Err(e) => {
                warn!(row, reason = %e, "skipping sample entry");
                report.skipped += 1;
            }
        }
    }
    if samples.is_empty() {
        return Err(LocError::NoValidSample {
            dropped: report.skipped,
        });
    }
    Ok((samples, report))
}

/// Registry CSV rows: `uuid, major, minor, x, y, z, floor`; `unit` scales
/// x and y.
pub fn beacons_from_csv<R: Read>(
    reader: R,
    unit: f64,
) -> Result<(Vec<BleBeacon>, LoadReport), LocError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut beacons = Vec::new();
    let mut report = LoadReport::default();
    for (row, record) in csv_reader.records().enumerate() {
        let parsed = record
            .map_err(|e| e.to_string())
            .and_then(|r| parse_beacon_record(&r, unit));
        match parsed {
            Ok(beacon) => {
                beacons.push(beacon);
                report.parsed += 1;
            }
            Err(reason) => {
                warn!(row, reason, "skipping beacon row");
                report.skipped += 1;
            }
        }
    }
    if beacons.is_empty() {
        return Err(LocError::EmptyBeacons);
    }
    Ok((beacons, report))
}

fn parse_beacon_record(record: &csv::StringRecord, unit: f64) -> Result<BleBeacon, String> {
    if record.len() < 7 {
        return Err(format!("expected 7 fields, got {}", record.len()));
    }
    let field = |i: usize| -> &str { record.get(i).unwrap_or("") };
    // field 0 is the proximity UUID, unused by the engine
    let major: u32 = field(1).parse().map_err(|_| "bad major".to_string())?;
    let minor: u32 = field(2).parse().map_err(|_| "bad minor".to_string())?;
    let x: f64 = field(3).parse().map_err(|_| "bad x".to_string())?;
    let y: f64 = field(4).parse().map_err(|_| "bad y".to_string())?;
    let z: f64 = field(5).parse().map_err(|_| "bad z".to_string())?;
    let floor: f64 = field(6).parse().map_err(|_| "bad floor".to_string())?;
    Ok(BleBeacon::new(
        major,
        minor,
        Location::new(x * unit, y * unit, z, floor),
    ))
}

/// Parse a map-spec string: either a single image path with single-floor
/// defaults, or repeated `floor,ppmx,ppmy,originx,originy,path` groups.
pub fn parse_map_spec(spec: &str) -> Result<Vec<FloorSpec>, LocError> {
    if !spec.contains(',') {
        if spec.is_empty() {
            return Err(LocError::Data("empty map spec".into()));
        }
        return Ok(vec![FloorSpec {
            floor: 0,
            ppm_x: 8.0,
            ppm_y: -8.0,
            origin_x: 1000.0,
            origin_y: 1000.0,
            path: spec.to_string(),
        }]);
    }

    let items: Vec<&str> = spec.split(',').map(str::trim).collect();
    if items.len() % 6 != 0 {
        return Err(LocError::Data(format!(
            "map spec has {} fields, expected a multiple of 6",
            items.len()
        )));
    }
    let mut floors = Vec::new();
    for group in items.chunks(6) {
        let parse_f64 = |s: &str, what: &str| -> Result<f64, LocError> {
            s.parse()
                .map_err(|_| LocError::Data(format!("bad {what} in map spec: {s}")))
        };
        floors.push(FloorSpec {
            floor: group[0]
                .parse()
                .map_err(|_| LocError::Data(format!("bad floor in map spec: {}", group[0])))?,
            ppm_x: parse_f64(group[1], "ppmx")?,
            ppm_y: parse_f64(group[2], "ppmy")?,
            origin_x: parse_f64(group[3], "originx")?,
            origin_y: parse_f64(group[4], "originy")?,
            path: group[5].to_string(),
        });
    }
    Ok(floors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const LONG_CSV: &str = "\
1000,1.5,2.5,0,0,2,10,1,-60.5,10,2,-72\n\
2000,3,4,0,1,0\n\
bogus,row\n\
3000,5,6,0,1,1,11,7,-80\n";

    #[test]
    fn long_csv_rows_parse_and_bad_rows_are_counted() {
        let (samples, report) = samples_from_csv(LONG_CSV.as_bytes()).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(report, LoadReport { parsed: 3, skipped: 1 });
        assert_eq!(samples[0].beacons.len(), 2);
        assert_relative_eq!(samples[0].beacons[0].rssi, -60.5);
        assert_eq!(samples[1].beacons.len(), 0);
        assert_relative_eq!(samples[2].location.floor, 1.0);
    }

    #[test]
    fn short_csv_applies_the_three_foot_unit() {
        let csv = "1000,10,20,0,0,0\n";
        let (samples, _) = samples_from_short_csv(csv.as_bytes()).unwrap();
        assert_relative_eq!(samples[0].location.x, 9.144, epsilon = 1e-12);
        assert_relative_eq!(samples[0].location.y, 18.288, epsilon = 1e-12);
    }

    #[test]
    fn all_rows_bad_is_a_data_error() {
        let csv = "bogus\nrows,only\n";
        assert!(matches!(
            samples_from_csv(csv.as_bytes()),
            Err(LocError::NoValidSample { dropped: 2 })
        ));
    }

    #[test]
    fn csv_round_trip_reproduces_the_sample_list() {
        let (samples, _) = samples_from_csv(LONG_CSV.as_bytes()).unwrap();
        let mut buffer = Vec::new();
        samples_to_csv(&mut buffer, &samples).unwrap();
        let (reloaded, report) = samples_from_csv(buffer.as_slice()).unwrap();
        assert_eq!(report.skipped, 0);
        assert_eq!(samples, reloaded);
    }

    #[test]
    fn json_variant_parses_and_skips_malformed_entries() {
        let json = r#"[
            {"timestamp": 1000,
             "location": {"x": 1.0, "y": 2.0, "z": 0.0, "floor": 0.0},
             "beacons": [{"major": 10, "minor": 1, "rssi": -61.0}]},
            {"not": "a sample"}
        ]"#;
        let (samples, report) = samples_from_json(json.as_bytes()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(samples[0].beacons[0], Beacon::new(10, 1, -61.0));
    }

    #[test]
    fn beacon_registry_parses_with_unit_scaling() {
        let csv = "\
F7826DA6-4FA2-4E98-8024-BC5B71E0893E,10,1,12,34,1.5,0\n\
F7826DA6-4FA2-4E98-8024-BC5B71E0893E,10,2,56,78,1.5,1\n";
        let (beacons, report) = beacons_from_csv(csv.as_bytes(), 0.5).unwrap();
        assert_eq!(report.parsed, 2);
        assert_relative_eq!(beacons[0].location.x, 6.0);
        assert_relative_eq!(beacons[0].location.y, 17.0);
        // z and floor are not unit-scaled
        assert_relative_eq!(beacons[0].location.z, 1.5);
        assert_relative_eq!(beacons[1].location.floor, 1.0);
    }

    #[test]
    fn single_path_map_spec_uses_single_floor_defaults() {
        let floors = parse_map_spec("floor0.png").unwrap();
        assert_eq!(floors.len(), 1);
        assert_eq!(floors[0].floor, 0);
        assert_relative_eq!(floors[0].ppm_x, 8.0);
        assert_relative_eq!(floors[0].ppm_y, -8.0);
        assert_relative_eq!(floors[0].origin_x, 1000.0);
        assert_eq!(floors[0].path, "floor0.png");
    }

    #[test]
    fn multi_floor_map_spec_parses_groups_of_six() {
        let floors =
            parse_map_spec("0,8,-8,100,200,f0.png,1,8,-8,100,200,f1.png").unwrap();
        assert_eq!(floors.len(), 2);
        assert_eq!(floors[1].floor, 1);
        assert_eq!(floors[1].path, "f1.png");
        assert_relative_eq!(floors[0].origin_y, 200.0);
    }

    #[test]
    fn truncated_map_spec_is_rejected() {
        assert!(parse_map_spec("0,8,-8,100,200").is_err());
    }
}
