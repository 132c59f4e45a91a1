//! Configuration tests

use super::*;

#[test]
fn test_free_space_parse_gigabytes() {
    assert_eq!(FreeSpace::parse("600"), Some(FreeSpace::Gigabytes(600.0)));
    assert_eq!(FreeSpace::parse(" 2.5 "), Some(FreeSpace::Gigabytes(2.5)));
}

#[test]
fn test_free_space_parse_percent() {
    assert_eq!(FreeSpace::parse("5%"), Some(FreeSpace::Percent(5.0)));
    assert_eq!(FreeSpace::parse("12.5 %"), Some(FreeSpace::Percent(12.5)));
}

#[test]
fn test_free_space_parse_garbage() {
    assert_eq!(FreeSpace::parse("lots"), None);
    assert_eq!(FreeSpace::parse("%"), None);
}

#[test]
fn test_free_space_target_bytes() {
    let total = 1_000_000_000_000; // 1 TB
    assert_eq!(
        FreeSpace::Gigabytes(600.0).target_bytes(total),
        600_000_000_000
    );
    assert_eq!(FreeSpace::Percent(5.0).target_bytes(total), 50_000_000_000);
}

#[test]
fn test_file_config_parses_remote_clusters() {
    let toml_str = r#"
        node = "cap01"
        pcap_dir = "/data/pcap0;/data/pcap1"
        free_space_g = "5%"

        [remote-clusters.backup]
        url = "https://backup.example.com:8005"
        server_secret = "s3cret"
    "#;
    let file: FileConfig = toml::from_str(toml_str).expect("config should parse");
    assert_eq!(file.node.as_deref(), Some("cap01"));
    assert_eq!(file.remote_clusters.len(), 1);
    let cluster = &file.remote_clusters["backup"];
    assert_eq!(cluster.url, "https://backup.example.com:8005");
    assert_eq!(cluster.secret_or("fallback"), "s3cret");
}

#[test]
fn test_remote_cluster_secret_fallback() {
    let cluster = RemoteCluster {
        url: "http://other".to_string(),
        server_secret: None,
        password_secret: None,
    };
    assert_eq!(cluster.secret_or("ours"), "ours");
}

#[test]
fn test_is_https_requires_both_key_and_cert() {
    let mut config = Config::default();
    assert!(!config.is_https());
    config.key_file = Some("/tls/key.pem".into());
    assert!(!config.is_https());
    config.cert_file = Some("/tls/cert.pem".into());
    assert!(config.is_https());
}

#[test]
fn test_default_hunt_limits_ordering() {
    let config = Config::default();
    assert!(config.hunt_warn < config.hunt_limit);
    assert!(config.hunt_limit < config.hunt_admin_limit);
}
