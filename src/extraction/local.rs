//! Offline extraction: pull text out of the checkcar.vin PDF and parse the
//! report layout line by line. The layout is the provider's English report:
//! section titles on their own line, label/value pairs on consecutive lines or
//! glued together on one.

use super::{ExtractionError, ReportExtractor};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct LocalExtractor;

#[async_trait]
impl ReportExtractor for LocalExtractor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn stage(&self, path: &Path) -> Option<String> {
        tokio::fs::metadata(path)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|_| path.display().to_string())
    }

    async fn convert(&self, source: &str, _cancel: &CancellationToken) -> Option<Value> {
        match extract_text(source).await {
            Ok(text) => {
                let report = parse_report_text(&text);
                info!(target = "vinrelay.pdfco", file = %source, "local_extraction_done");
                Some(report)
            }
            Err(err) => {
                warn!(target = "vinrelay.pdfco", file = %source, error = %err, "local_extraction_failed");
                None
            }
        }
    }
}

async fn extract_text(path: &str) -> Result<String, ExtractionError> {
    let bytes = tokio::fs::read(path).await?;
    tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|err| ExtractionError::Parse(err.to_string()))?
        .map_err(|err| ExtractionError::Parse(err.to_string()))
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

static MODEL_YEAR: Lazy<Regex> = Lazy::new(|| re(r"^(.*),\s*(\d{4})$"));
static DATE: Lazy<Regex> = Lazy::new(|| re(r"(\d{4}-\d{2}-\d{2})"));
static FULL_DATE: Lazy<Regex> = Lazy::new(|| re(r"^\d{4}-\d{2}-\d{2}$"));
static KM_LINE: Lazy<Regex> = Lazy::new(|| re(r"(?i)^(\d[\d,]*)\s?km$"));
static KM_ANY: Lazy<Regex> = Lazy::new(|| re(r"(?i)([\d,]+\s*km)"));
static OWNER: Lazy<Regex> = Lazy::new(|| re(r"^(\d+)\s+owner"));
static ACCIDENT: Lazy<Regex> = Lazy::new(|| re(r"^Accident #(\d+)"));
static DETAIL: Lazy<Regex> = Lazy::new(|| re(r"(?i)Detail\s*([\d,]+)\s*USD"));
static WAGES: Lazy<Regex> = Lazy::new(|| re(r"(?i)Wages\s*([\d,]+)\s*USD"));
static PAINTING: Lazy<Regex> = Lazy::new(|| re(r"(?i)Pain(?:t|n)ing\s*([\d,]+)\s*USD"));
static REPAIR: Lazy<Regex> = Lazy::new(|| re(r"(?i)Total Repair.*cost\s*([\d,]+)\s*USD"));
static SOLD: Lazy<Regex> = Lazy::new(|| re(r"^SOLD\s+#(\d+)"));
static AUCTION_FULL: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)(\d+)\s*USD\s*([\d,]+)\s*km\s*([A-Z0-9.]+)\s*(\d{4}-\d{2}-\d{2})"));
static AUCTION_COMPACT: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)^(\d+)\s*USD\s*([A-Z0-9.]+)(\d{4}-\d{2}-\d{2})$"));
static INSPECTION_FROM: Lazy<Regex> = Lazy::new(|| re(r"Date from\s*(\d{4}-\d{2}-\d{2})"));
static INSPECTION_TO: Lazy<Regex> = Lazy::new(|| re(r"Date to\s*(\d{4}-\d{2}-\d{2})"));
static INSPECTION_KM: Lazy<Regex> = Lazy::new(|| re(r"Mileage\s*([\d,]+)\s*km"));
static INSTALLED_COUNT: Lazy<Regex> = Lazy::new(|| re(r"(?i)^\d+\s+installed$"));

const SPEC_LABELS: &[(&str, &str)] = &[
    ("year", "year"),
    ("country", "country"),
    ("make", "make"),
    ("model", "model"),
    ("body", "body"),
    ("doors", "doors"),
    ("color", "color"),
    ("engine capacity", "engine_capacity"),
    ("standard seating", "standard_seating"),
    ("fuel type", "fuel_type"),
    ("drive type", "drive_type"),
    ("transmission", "transmission"),
    ("keys", "keys"),
    ("height", "height"),
    ("length", "length"),
    ("width", "width"),
];

/// Labels that the PDF wraps over two lines in the general section.
const WRAPPED_LABELS: &[(&str, &str, &str)] = &[
    ("Special purpose", "history", "Special purpose history"),
    ("Damage to this car by", "another car", "Damage to this car by another car"),
    ("Damage to another car", "by this car", "Damage to another car by this car"),
];

pub fn parse_report_text(text: &str) -> Value {
    let lines: Vec<String> = text
        .lines()
        .map(|line| line.replace('\0', "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();

    let mut report = json!({
        "model": null,
        "year": null,
        "vin": null,
        "report_id": null,
        "report_date": null,
        "general_information": {},
        "vehicle_specifications": {},
        "advanced_safety_systems": {},
        "ownership_history": [],
        "mileages": [],
    });

    for (i, line) in lines.iter().enumerate() {
        let next = lines.get(i + 1);
        match line.as_str() {
            "Vehicle history report" => {
                if let Some(caps) = next.and_then(|n| MODEL_YEAR.captures(n)) {
                    report["model"] = json!(caps[1].trim());
                    report["year"] = json!(&caps[2]);
                }
            }
            "VIN:" => set_next(&mut report, "vin", next),
            "Report ID:" => set_next(&mut report, "report_id", next),
            "Report Date:" => set_next(&mut report, "report_date", next),
            "General Information" => {
                report["general_information"] = general_information(&lines[i + 1..])
            }
            "Vehicle Specifications" => {
                report["vehicle_specifications"] = vehicle_specifications(&lines[i + 1..])
            }
            "Advanced Safety Devices" => {
                report["advanced_safety_systems"] = advanced_safety(&lines[i + 1..])
            }
            "Ownership history" => {
                let (count, owners) = ownership_history(&lines[i + 1..]);
                if let Some(count) = count {
                    report["number_of_owners"] = json!(count);
                }
                report["ownership_history"] = owners;
            }
            _ => {}
        }
    }

    if let Some(start) = lines.iter().position(|l| l == "Source: Checkcar.vin") {
        report["mileages"] = mileages(&lines[start + 1..]);
    }
    report["accidents"] = accidents(&lines);
    report["export_info"] = export_info(&lines);
    report["technical_inspection"] = technical_inspection(&lines);
    report["auction_sales"] = auction_sales(&lines);
    report
}

fn set_next(report: &mut Value, key: &str, next: Option<&String>) {
    if let Some(value) = next {
        report[key] = json!(value);
    }
}

fn snake(label: &str) -> String {
    super::sanitize::normalize_key(label.trim())
}

fn general_information(lines: &[String]) -> Value {
    let mut info = Map::new();
    let Some(summary) = lines.first() else {
        return Value::Object(info);
    };
    info.insert("general_information".into(), json!(summary));
    let mut j = 1;
    while j < lines.len() {
        let key = lines[j].as_str();
        let next = lines.get(j + 1).map(String::as_str).unwrap_or_default();
        let wrapped = WRAPPED_LABELS
            .iter()
            .find(|(first, second, _)| key == *first && next == *second);
        let (label, value) = match wrapped {
            Some((_, _, full)) => {
                let value = lines.get(j + 2).map(String::as_str).unwrap_or_default();
                j += 3;
                (full.to_string(), value)
            }
            None => {
                j += 2;
                (key.to_string(), next)
            }
        };
        if label == "History of public use" {
            info.insert("history_of_public_use".into(), json!(value));
            break;
        }
        info.insert(snake(&label), json!(value));
    }
    Value::Object(info)
}

fn vehicle_specifications(lines: &[String]) -> Value {
    let mut specs = Map::new();
    for line in lines
        .iter()
        .take_while(|l| !l.starts_with("Advanced Safety Devices"))
    {
        let lower = line.to_lowercase();
        for (label, key) in SPEC_LABELS {
            let glued = label.replace(' ', "");
            let rest = lower
                .strip_prefix(glued.as_str())
                .or_else(|| lower.strip_prefix(label));
            if let Some(rest) = rest {
                let start = line.len() - rest.len();
                specs.insert((*key).to_string(), json!(line[start..].trim()));
                break;
            }
        }
    }
    Value::Object(specs)
}

fn advanced_safety(lines: &[String]) -> Value {
    let mut features = Map::new();
    let mut i = 0;
    while i + 1 < lines.len() {
        let key = &lines[i];
        if INSTALLED_COUNT.is_match(key) {
            i += 1;
            continue;
        }
        if key == "Ownership history" {
            break;
        }
        let normalized = snake(&key.replace(['(', ')'], ""));
        features.insert(normalized, json!(lines[i + 1]));
        i += 2;
    }
    Value::Object(features)
}

fn ownership_history(lines: &[String]) -> (Option<u64>, Value) {
    let section: Vec<&String> = lines
        .iter()
        .take_while(|l| !l.starts_with("Mileages"))
        .collect();
    let mut rest = section.as_slice();
    let mut count = None;
    if let Some(caps) = rest.first().and_then(|l| OWNER.captures(l)) {
        count = caps[1].parse().ok();
        rest = &rest[1..];
    }

    let mut owners = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        let Some(caps) = OWNER.captures(rest[i]) else {
            i += 1;
            continue;
        };
        let mut owner = json!({
            "owner_number": caps[1].parse::<u64>().unwrap_or_default(),
            "mileage": null,
            "change_number": null,
            "change_owner": null,
            "vehicle_use": null,
            "date_record": null,
        });
        i += 1;
        while i < rest.len() && !OWNER.is_match(rest[i]) {
            let line = rest[i].as_str();
            for (label, key) in [
                ("Mileage", "mileage"),
                ("Change number", "change_number"),
                ("Change owner", "change_owner"),
                ("Vehicle use", "vehicle_use"),
                ("Date record", "date_record"),
            ] {
                if let Some(value) = line.strip_prefix(label) {
                    let value = value.trim();
                    if !value.is_empty() && value != "-" {
                        owner[key] = json!(value);
                    }
                    break;
                }
            }
            i += 1;
        }
        owners.push(owner);
    }
    (count, Value::Array(owners))
}

fn mileages(lines: &[String]) -> Value {
    let mut entries = Vec::new();
    for pair in lines.chunks(2) {
        let [date, km] = pair else { break };
        match (FULL_DATE.is_match(date), KM_LINE.captures(km)) {
            (true, Some(caps)) => entries.push(json!({
                "date": date,
                "mileage": format!("{} km", caps[1].replace(',', "")),
            })),
            _ => break,
        }
    }
    Value::Array(entries)
}

fn usd(re: &Regex, line: &str) -> Option<u64> {
    re.captures(line)
        .and_then(|caps| caps[1].replace(',', "").parse().ok())
}

fn accidents(lines: &[String]) -> Value {
    let mut found = Vec::new();
    let mut i = 1;
    while i < lines.len() {
        let Some(caps) = ACCIDENT.captures(&lines[i]) else {
            i += 1;
            continue;
        };
        let mut accident = json!({
            "number": caps[1].parse::<u64>().unwrap_or_default(),
            "date": lines[i - 1],
            "detail_usd": null,
            "wages_usd": null,
            "painting_usd": null,
            "repair_cost_usd": null,
            "culprit": true,
        });
        let mut j = i + 1;
        while j < lines.len() {
            let line = &lines[j];
            for (key, pattern) in [
                ("detail_usd", &*DETAIL),
                ("wages_usd", &*WAGES),
                ("painting_usd", &*PAINTING),
                ("repair_cost_usd", &*REPAIR),
            ] {
                if let Some(amount) = usd(pattern, line) {
                    accident[key] = json!(amount);
                }
            }
            if line.to_lowercase().contains("not the culprit") {
                accident["culprit"] = json!(false);
            }
            j += 1;
            if line.contains("Accident vehicle 2") {
                break;
            }
        }
        found.push(accident);
        i = j + 1;
    }
    Value::Array(found)
}

fn export_info(lines: &[String]) -> Value {
    let mut info = json!({
        "exported_from_korea": false,
        "mileage": null,
        "first_registration": null,
        "last_registration": null,
        "deregistration_date": null,
        "appointment_of_deregistration": false,
        "damaged": false,
    });
    for line in lines {
        let lower = line.to_lowercase();
        let date = || DATE.captures(line).map(|c| c[1].to_string());
        if lower.contains("export from korea") {
            info["exported_from_korea"] = json!(true);
        }
        if lower.contains("mileage") {
            if let Some(caps) = KM_ANY.captures(line) {
                info["mileage"] = json!(caps[1].split_whitespace().collect::<String>());
            }
        }
        if lower.contains("date first registra") {
            if let Some(d) = date() {
                info["first_registration"] = json!(d);
            }
        }
        if lower.contains("last first registra") {
            if let Some(d) = date() {
                info["last_registration"] = json!(d);
            }
        }
        if lower.contains("date registra") && lower.contains("cancella") {
            if let Some(d) = date() {
                info["deregistration_date"] = json!(d);
            }
        }
        if lower.contains("appointment of deregistration") {
            info["appointment_of_deregistration"] = json!(true);
        }
        if lower.starts_with("damaged") {
            let value = line.get("damaged".len()..).unwrap_or_default().trim().to_lowercase();
            info["damaged"] = json!(value != "-" && value != "no");
        }
    }
    info
}

fn technical_inspection(lines: &[String]) -> Value {
    let mut result = json!({
        "valid_from": null,
        "valid_to": null,
        "mileage_at_inspection": null,
    });
    let Some(start) = lines.iter().position(|l| l.contains("Technical inspection")) else {
        return result;
    };
    let Some(len) = lines[start..]
        .iter()
        .skip(1)
        .position(|l| l.contains("Source: Checkcar.vin"))
    else {
        return result;
    };
    for line in &lines[start..=start + len + 1] {
        if let Some(caps) = INSPECTION_FROM.captures(line) {
            result["valid_from"] = json!(&caps[1]);
        }
        if let Some(caps) = INSPECTION_TO.captures(line) {
            result["valid_to"] = json!(&caps[1]);
        }
        if let Some(caps) = INSPECTION_KM.captures(line) {
            result["mileage_at_inspection"] = json!(format!("{} km", caps[1].replace(',', "")));
        }
    }
    result
}

fn auction_sales(lines: &[String]) -> Value {
    let mut auctions: Vec<Value> = Vec::new();
    for line in lines {
        if let Some(caps) = SOLD.captures(line) {
            auctions.push(json!({
                "number": caps[1].parse::<u64>().unwrap_or_default(),
                "price_usd": null,
                "mileage": null,
                "platform": null,
                "date": null,
                "make": null,
                "model": null,
                "year": null,
                "engine_capacity": null,
                "body": null,
                "transmission": null,
            }));
        }
        let Some(current) = auctions.last_mut() else {
            continue;
        };
        if let Some(caps) = AUCTION_FULL.captures(line) {
            current["price_usd"] = json!(caps[1].parse::<u64>().ok());
            current["mileage"] = json!(format!("{} km", caps[2].replace(',', "")));
            current["platform"] = json!(&caps[3]);
            current["date"] = json!(&caps[4]);
            continue;
        }
        if let Some(caps) = AUCTION_COMPACT.captures(line) {
            current["price_usd"] = json!(caps[1].parse::<u64>().ok());
            current["platform"] = json!(&caps[2]);
            current["date"] = json!(&caps[3]);
            continue;
        }
        for (label, key) in [
            ("Make", "make"),
            ("Model", "model"),
            ("Engine capacity", "engine_capacity"),
            ("Body", "body"),
            ("Transmission", "transmission"),
        ] {
            if let Some(value) = line.strip_prefix(label) {
                current[key] = json!(value.trim());
                break;
            }
        }
        if let Some(year) = line.strip_prefix("Year").and_then(|v| v.trim().parse::<u64>().ok()) {
            current["year"] = json!(year);
        }
    }
    Value::Array(auctions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::sanitize::has_vehicle_fields;

    const SAMPLE: &str = "\
Vehicle history report
Hyundai Sonata, 2016
VIN:
KMHJ3815GGU085263
Report ID:
R-5521
Report Date:
2026-10-01
General Information
5/12 attention marks
Accidents
2
Special purpose
history
None
History of public use
No
Vehicle Specifications
Year2016
Country대한민국
Fuel type Gasoline
Engine capacity 1999 cc
Advanced Safety Devices
2 installed
Lane keeping (LKAS)
Installed
Ownership history
2 owners
1 owner
Mileage 12,000 km
Change number -
Date record 2016-05-01
2 owner
Vehicle use Private
Mileages
Source: Checkcar.vin
2019-01-10
45,000 km
2021-03-02
80,120 km
2016-04-11
Accident #1
Detail 1,200 USD
Wages 300 USD
Total Repair cost 1,900 USD
Not the culprit
Accident vehicle 2
Export from Korea
Damaged no
SOLD #1
5400 USD 80,100 km COPART 2022-02-01
Make Hyundai
Year 2016
";

    #[test]
    fn parses_header_fields() {
        let report = parse_report_text(SAMPLE);
        assert_eq!(report["model"], "Hyundai Sonata");
        assert_eq!(report["year"], "2016");
        assert_eq!(report["vin"], "KMHJ3815GGU085263");
        assert_eq!(report["report_id"], "R-5521");
        assert!(has_vehicle_fields(&report));
    }

    #[test]
    fn parses_sections() {
        let report = parse_report_text(SAMPLE);
        let general = &report["general_information"];
        assert_eq!(general["general_information"], "5/12 attention marks");
        assert_eq!(general["special_purpose_history"], "None");
        assert_eq!(general["history_of_public_use"], "No");

        let specs = &report["vehicle_specifications"];
        assert_eq!(specs["year"], "2016");
        assert_eq!(specs["country"], "대한민국");
        assert_eq!(specs["fuel_type"], "Gasoline");
        assert_eq!(specs["engine_capacity"], "1999 cc");

        assert_eq!(report["advanced_safety_systems"]["lane_keeping_lkas"], "Installed");
        assert_eq!(report["number_of_owners"], 2);
        assert_eq!(report["ownership_history"][0]["mileage"], "12,000 km");
        assert_eq!(report["ownership_history"][0]["change_number"], Value::Null);
        assert_eq!(report["ownership_history"][1]["vehicle_use"], "Private");
    }

    #[test]
    fn parses_histories() {
        let report = parse_report_text(SAMPLE);
        assert_eq!(report["mileages"][1]["mileage"], "80120 km");
        let accident = &report["accidents"][0];
        assert_eq!(accident["date"], "2016-04-11");
        assert_eq!(accident["detail_usd"], 1200);
        assert_eq!(accident["repair_cost_usd"], 1900);
        assert_eq!(accident["culprit"], false);
        assert_eq!(report["export_info"]["exported_from_korea"], true);
        assert_eq!(report["export_info"]["damaged"], false);
        let sale = &report["auction_sales"][0];
        assert_eq!(sale["price_usd"], 5400);
        assert_eq!(sale["platform"], "COPART");
        assert_eq!(sale["year"], 2016);
    }

    #[test]
    fn empty_text_yields_empty_shape() {
        let report = parse_report_text("");
        assert_eq!(report["vin"], Value::Null);
        assert_eq!(report["accidents"], json!([]));
        assert!(!has_vehicle_fields(&json!({"accidents": []})));
    }
}
