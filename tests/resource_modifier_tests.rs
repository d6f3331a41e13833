use std::collections::HashMap;
use std::sync::Arc;

use persistent_worker::config::WorkerConfig;
use persistent_worker::resources::{ResourceModifierConfig, ResourceModifierManager, Resources};

fn gpu_modifier(name: &str, gpus: f64) -> ResourceModifierConfig {
    ResourceModifierConfig {
        match_resources: HashMap::from([("gpu".to_string(), gpus)]),
        append: vec![format!("--gpu={}", name)],
    }
}

#[test]
fn test_first_free_matching_modifier_wins() {
    let manager = ResourceModifierManager::new(vec![
        gpu_modifier("first", 1.0),
        gpu_modifier("second", 1.0),
    ]);
    let request = Resources::new().with("gpu", 1.0);

    let first = manager.acquire(&request).unwrap();
    assert_eq!(first.append_args(), ["--gpu=first".to_string()]);

    let second = manager.acquire(&request).unwrap();
    assert_eq!(second.append_args(), ["--gpu=second".to_string()]);

    assert!(manager.acquire(&request).is_none(), "all modifiers held");
}

#[test]
fn test_release_makes_modifier_available_again() {
    let manager = ResourceModifierManager::new(vec![gpu_modifier("only", 1.0)]);
    let request = Resources::new().with("gpu", 2.0);

    let lease = manager.acquire(&request).unwrap();
    assert!(manager.acquire(&request).is_none());

    drop(lease);
    assert!(manager.acquire(&request).is_some());
}

#[test]
fn test_request_below_threshold_does_not_match() {
    let manager = ResourceModifierManager::new(vec![gpu_modifier("big", 2.0)]);

    assert!(manager.acquire(&Resources::new().with("gpu", 1.0)).is_none());
    assert!(manager.acquire(&Resources::new()).is_none());
    assert!(manager.acquire(&Resources::new().with("gpu", 2.0)).is_some());
}

#[test]
fn test_concurrent_acquisition_is_exclusive() {
    let manager = Arc::new(ResourceModifierManager::new(vec![
        gpu_modifier("a", 1.0),
        gpu_modifier("b", 1.0),
    ]));
    let request = Resources::new().with("gpu", 1.0);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            let request = request.clone();
            std::thread::spawn(move || manager.acquire(&request))
        })
        .collect();

    let leases: Vec<_> = handles
        .into_iter()
        .filter_map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(leases.len(), 2);
    let mut args: Vec<String> = leases
        .iter()
        .map(|lease| lease.append_args()[0].clone())
        .collect();
    args.sort();
    assert_eq!(args, vec!["--gpu=a".to_string(), "--gpu=b".to_string()]);
}

#[test]
fn test_modifiers_load_from_yaml() {
    let yaml = r#"
upstreams:
  - url: https://grpc.cirrus-ci.com
    token: secret
resource_modifiers:
  - match:
      gpu: 1
    append: ["--gpu=0000:01:00.0"]
"#;
    let config = WorkerConfig::from_yaml_str(yaml).unwrap();
    let manager = ResourceModifierManager::new(config.resource_modifiers);

    let lease = manager.acquire(&Resources::new().with("gpu", 1.0)).unwrap();
    assert_eq!(lease.append_args(), ["--gpu=0000:01:00.0".to_string()]);
}
