use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use pet_door_monitor::config::MonitorConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PETDOOR_CONFIG",
        "PETDOOR_STORAGE_PATH",
        "PETDOOR_FPS",
        "PETDOOR_SOURCE",
        "PETDOOR_API_ADDR",
        "PETDOOR_HIGH_WATER_MARK_GB",
        "PETDOOR_DETECTION_CONFIDENCE",
        "PETDOOR_COOLDOWN_SECS",
        "PETDOOR_CLASSIFIER",
        "PETDOOR_MODEL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "storage_path": "/var/lib/petdoor",
            "api_addr": "127.0.0.1:8080",
            "source": { "url": "/dev/video2" },
            "classifier": { "backend": "tract", "model_path": "yolov8n.onnx", "input_size": 320 },
            "pipeline": {
                "fps": 4,
                "width": 640,
                "height": 480,
                "motion_threshold_percent": 12.5,
                "save_on_motion_without_detection": false
            }
        }"#,
    );

    std::env::set_var("PETDOOR_CONFIG", file.path());
    std::env::set_var("PETDOOR_FPS", "6");
    std::env::set_var("PETDOOR_DETECTION_CONFIDENCE", "0.65");
    std::env::set_var("PETDOOR_COOLDOWN_SECS", "2.5");

    let cfg = MonitorConfig::load().expect("load config");

    assert_eq!(cfg.storage_path, PathBuf::from("/var/lib/petdoor"));
    assert_eq!(cfg.api_addr, "127.0.0.1:8080");
    assert_eq!(cfg.source_url, "/dev/video2");
    assert_eq!(cfg.classifier.backend, "tract");
    assert_eq!(cfg.classifier.model_path, Some(PathBuf::from("yolov8n.onnx")));
    assert_eq!(cfg.classifier.input_size, 320);
    assert_eq!(cfg.pipeline.fps, 6);
    assert_eq!(cfg.pipeline.resolution.width, 640);
    assert_eq!(cfg.pipeline.resolution.height, 480);
    assert_eq!(cfg.pipeline.detection_confidence, 0.65);
    assert_eq!(cfg.pipeline.motion_threshold_percent, 12.5);
    assert_eq!(cfg.pipeline.cooldown_seconds, 2.5);
    assert_eq!(cfg.pipeline.high_water_mark_gb, 10.0);
    assert!(!cfg.pipeline.save_on_motion_without_detection);

    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = MonitorConfig::load().expect("load defaults");

    assert!(cfg.storage_path.ends_with("pet-door-data"));
    assert_eq!(cfg.api_addr, "0.0.0.0:5000");
    assert_eq!(cfg.source_url, "stub://front_door");
    assert_eq!(cfg.classifier.backend, "stub");
    assert_eq!(cfg.pipeline.fps, 2);
    assert_eq!(cfg.pipeline.resolution.width, 1280);
    assert_eq!(cfg.pipeline.resolution.height, 720);
    assert_eq!(cfg.pipeline.detection_confidence, 0.5);
    assert_eq!(cfg.pipeline.motion_threshold_percent, 30.0);
    assert_eq!(cfg.pipeline.cooldown_seconds, 5.0);
    assert!(cfg.pipeline.save_on_motion_without_detection);
}

#[test]
fn rejects_out_of_range_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "pipeline": { "fps": 0 } }"#);
    assert!(MonitorConfig::load_from(Some(file.path())).is_err());

    let file = write_config(r#"{ "pipeline": { "detection_confidence": 1.2 } }"#);
    assert!(MonitorConfig::load_from(Some(file.path())).is_err());

    std::env::set_var("PETDOOR_HIGH_WATER_MARK_GB", "-3");
    assert!(MonitorConfig::load_from(None).is_err());
    std::env::set_var("PETDOOR_HIGH_WATER_MARK_GB", "lots");
    assert!(MonitorConfig::load_from(None).is_err());

    clear_env();
}

#[test]
fn rejects_malformed_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("{ not json");
    let err = MonitorConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    let missing = std::path::Path::new("/nonexistent/petdoor.json");
    assert!(MonitorConfig::load_from(Some(missing)).is_err());
}
