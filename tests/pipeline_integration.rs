//! ---
//! efx_section: "07-testing-qa"
//! efx_subsection: "integration-tests"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Integration tests for the decode-flatten-publish pipeline."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
use base64::Engine as _;
use efx_common::{NameSource, QuotaValue};
use efx_devices::{DeviceResolver, DeviceTable};
use efx_metrics::{flatten, new_registry, DeviceLabels, MetricsPool};
use efx_proto::wire::{put_bytes_field, put_varint_field};
use efx_proto::FrameDecoder;

const DEVICE_SN: &str = "R331ZEB4ZEAL0528";

fn device_labels(resolver: &DeviceResolver) -> DeviceLabels {
    DeviceLabels {
        device: DEVICE_SN.to_owned(),
        device_name: resolver.device_name(DEVICE_SN, None),
        product_name: String::new(),
        device_general_key: resolver.general_key(DEVICE_SN),
    }
}

fn resolver() -> DeviceResolver {
    DeviceResolver::with_table(
        DeviceTable::empty(),
        Some("garage-battery".to_owned()),
        Some("river2max".to_owned()),
        vec![NameSource::Override, NameSource::Serial],
    )
}

/// Binary status envelope as a device would publish it: base64-wrapped,
/// XOR-obfuscated payload under the authoritative command pair.
fn published_envelope() -> Vec<u8> {
    let seq: u64 = 0x3c;
    let key = (seq & 0xff) as u8;

    let mut status = Vec::new();
    put_varint_field(&mut status, 1, 87); // soc
    put_varint_field(&mut status, 4, 240); // watts

    let obfuscated: Vec<u8> = status.iter().map(|b| b ^ key).collect();
    let mut header = Vec::new();
    put_bytes_field(&mut header, 1, &obfuscated);
    put_varint_field(&mut header, 2, 2); // src: device
    put_varint_field(&mut header, 6, 1); // enc_type: obfuscated
    put_varint_field(&mut header, 8, 254);
    put_varint_field(&mut header, 9, 21);
    put_varint_field(&mut header, 10, obfuscated.len() as u64);
    put_varint_field(&mut header, 14, seq);

    let mut envelope = Vec::new();
    put_bytes_field(&mut envelope, 1, &header);
    base64::engine::general_purpose::STANDARD
        .encode(&envelope)
        .into_bytes()
}

#[test]
fn binary_envelope_flows_to_the_scrape_endpoint_shape() {
    let decoded = FrameDecoder::new()
        .decode(&published_envelope())
        .expect("valid envelope");

    let resolver = resolver();
    let labels = device_labels(&resolver);
    let samples = flatten("ecoflow", &labels, &decoded);
    assert_eq!(samples.len(), 2);

    let registry = new_registry();
    let pool = MetricsPool::new(registry.clone());
    for sample in &samples {
        pool.set_sample(sample);
    }

    let families = registry.gather();
    let soc = families
        .iter()
        .find(|f| f.get_name() == "ecoflow_1")
        .expect("field 1 gauge present");
    let metric = &soc.get_metric()[0];
    assert_eq!(metric.get_gauge().get_value(), 87.0);
    let label_map: Vec<(&str, &str)> = metric
        .get_label()
        .iter()
        .map(|l| (l.get_name(), l.get_value()))
        .collect();
    assert!(label_map.contains(&("device", DEVICE_SN)));
    assert!(label_map.contains(&("device_name", "garage-battery")));
    assert!(label_map.contains(&("device_general_key", "river2max")));
}

#[test]
fn json_push_flows_through_flattening_and_clearing() {
    let push = serde_json::json!({
        "bms_bmsStatus": {"soc": 87, "temp": 31},
        "battery": [{"soc": 85}, {"soc": 42}]
    });
    let values = QuotaValue::from_json(push);

    let resolver = resolver();
    let labels = device_labels(&resolver);
    let samples = flatten("ecoflow", &labels, &values);
    assert_eq!(samples.len(), 4);

    let registry = new_registry();
    let pool = MetricsPool::new(registry.clone());
    for sample in &samples {
        pool.set_sample(sample);
    }
    let names: Vec<String> = registry
        .gather()
        .iter()
        .map(|f| f.get_name().to_owned())
        .collect();
    assert!(names.contains(&"ecoflow_bms_bms_status_soc".to_owned()));
    assert!(names.contains(&"ecoflow_battery_soc".to_owned()));

    // Device drops away: the pool clears and the scrape goes quiet.
    pool.clear();
    let remaining: usize = registry
        .gather()
        .iter()
        .map(|f| f.get_metric().len())
        .sum();
    assert_eq!(remaining, 0);
}
