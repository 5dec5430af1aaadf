use std::sync::Mutex;

use tempfile::{Builder, NamedTempFile};

use streamsafe::config::StreamSafeConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "STREAMSAFE_CONFIG",
        "STREAMSAFE_API_ADDR",
        "STREAMSAFE_API_TOKEN_PATH",
        "STREAMSAFE_SOURCE",
        "STREAMSAFE_PLATE_MODEL",
        "STREAMSAFE_ENABLE",
        "STREAMSAFE_OUTPUT_DIR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let token_path = file.path().with_extension("token");
    let json = format!(
        r#"{{
            "api": {{
                "addr": "0.0.0.0:9000",
                "token_path": "{}"
            }},
            "source": {{
                "uri": "rtsp://camera-1/stream",
                "target_fps": 12,
                "width": 800,
                "height": 600
            }},
            "detection": {{
                "license_plates": true,
                "street_signs": true
            }},
            "detectors": {{
                "sign_cadence": 10,
                "plate_blur_kernel": 31
            }},
            "live": {{
                "queue_depth": 4,
                "preview": false
            }},
            "jobs": {{
                "history_cap": 20
            }}
        }}"#,
        token_path.display()
    );
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("STREAMSAFE_CONFIG", file.path());
    std::env::set_var("STREAMSAFE_ENABLE", "blocks");
    std::env::set_var("STREAMSAFE_OUTPUT_DIR", "/tmp/streamsafe-out");

    let cfg = StreamSafeConfig::load().expect("load config");

    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.api_token_path.unwrap(), token_path);
    assert_eq!(cfg.source.uri, "rtsp://camera-1/stream");
    assert_eq!(cfg.source.target_fps, 12);
    assert_eq!(cfg.source.width, 800);
    assert_eq!(cfg.source.height, 600);
    // Env replaces the file's toggles entirely.
    assert!(cfg.detection.block_numbers);
    assert!(!cfg.detection.license_plates);
    assert!(!cfg.detection.street_signs);
    assert_eq!(cfg.detectors.sign_cadence, 10);
    assert_eq!(cfg.detectors.block_cadence, 30);
    assert_eq!(cfg.detectors.plate_blur_kernel, 31);
    assert_eq!(cfg.live.queue_depth, 4);
    assert!(!cfg.live.preview);
    assert_eq!(cfg.jobs.history_cap, 20);
    assert_eq!(cfg.jobs.output_dir.to_str(), Some("/tmp/streamsafe-out"));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
        [source]
        uri = "stub://lab"

        [detectors]
        plate_model = "models/plates.onnx"
        plate_confidence = 0.5
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("STREAMSAFE_CONFIG", file.path());

    let cfg = StreamSafeConfig::load().expect("load config");
    assert_eq!(cfg.source.uri, "stub://lab");
    assert_eq!(cfg.source.target_fps, 30);
    assert_eq!(
        cfg.detectors.plate_model.as_deref().and_then(|p| p.to_str()),
        Some("models/plates.onnx")
    );
    assert_eq!(cfg.detectors.plate_confidence, 0.5);
    assert_eq!(cfg.api_addr, "127.0.0.1:8000");

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = StreamSafeConfig::load().expect("load defaults");
    assert_eq!(cfg.source.uri, "stub://street_camera");
    assert_eq!(cfg.detection, Default::default());
    assert_eq!(cfg.live.queue_depth, 2);
    assert_eq!(cfg.jobs.history_cap, 100);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("STREAMSAFE_API_ADDR", "not-an-addr");
    assert!(StreamSafeConfig::load().is_err());
    clear_env();

    std::env::set_var("STREAMSAFE_ENABLE", "plates,faces");
    assert!(StreamSafeConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"detectors": {"sign_blur_kernel": 20}}"#)
        .expect("write config");
    std::env::set_var("STREAMSAFE_CONFIG", file.path());
    assert!(StreamSafeConfig::load().is_err());

    clear_env();
}
