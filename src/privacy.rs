use crate::settings::SettingsStore;

/// Proxy flavor the privacy provider hands out. `None` means a direct
/// connection even when the transfer asked for `Proxy` mode.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum ProxyKind {
  #[default]
  None,
  Http,
  Socks4,
  Socks5,
}

impl ProxyKind {
  pub fn from_setting(value: &str) -> Self {
    match value.trim().to_ascii_lowercase().as_str() {
      "http" => ProxyKind::Http,
      "socks4" => ProxyKind::Socks4,
      "socks5" => ProxyKind::Socks5,
      _ => ProxyKind::None,
    }
  }

  pub fn scheme(&self) -> Option<&'static str> {
    match self {
      ProxyKind::None => None,
      ProxyKind::Http => Some("http"),
      ProxyKind::Socks4 => Some("socks4"),
      ProxyKind::Socks5 => Some("socks5"),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
  pub kind: ProxyKind,
  pub address: String,
  pub port: u16,
  pub username: String,
  pub password: String,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
  pub address: String,
  pub port: u16,
  pub control_port: u16,
}

impl Default for RelaySettings {
  fn default() -> Self {
    Self {
      address: "127.0.0.1".to_string(),
      port: 9050,
      control_port: 9051,
    }
  }
}

/// Seam to the external privacy subsystem. The engine only asks; it never
/// configures the relay or rewrites proxy state.
pub trait PrivacyProvider: Send + Sync {
  /// Whether the local anonymity relay is up and should be offered to
  /// `Relay`-mode transfers.
  fn relay_enabled(&self) -> bool;

  fn relay_settings(&self) -> RelaySettings;

  fn proxy_settings(&self) -> ProxySettings;

  /// Control-port "new circuit" signal. Default is a no-op that reports the
  /// request was not honored; embedders with relay control access override
  /// this.
  fn request_new_circuit(&self) -> bool {
    false
  }
}

/// Provider backed by the `privacy` section of the settings store.
#[derive(Clone)]
pub struct SettingsPrivacyProvider {
  settings: SettingsStore,
}

impl SettingsPrivacyProvider {
  pub fn new(settings: SettingsStore) -> Self {
    Self { settings }
  }
}

impl PrivacyProvider for SettingsPrivacyProvider {
  fn relay_enabled(&self) -> bool {
    self.settings.get("relay_enabled", false)
  }

  fn relay_settings(&self) -> RelaySettings {
    let defaults = RelaySettings::default();
    RelaySettings {
      address: self.settings.get("relay_address", defaults.address),
      port: self.settings.get("relay_port", defaults.port),
      control_port: self.settings.get("relay_control_port", defaults.control_port),
    }
  }

  fn proxy_settings(&self) -> ProxySettings {
    ProxySettings {
      kind: ProxyKind::from_setting(&self.settings.get("proxy_type", "None".to_string())),
      address: self.settings.get("proxy_address", String::new()),
      port: self.settings.get("proxy_port", 8080),
      username: self.settings.get("proxy_username", String::new()),
      password: self.settings.get("proxy_password", String::new()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn proxy_kind_parsing_is_case_insensitive() {
    assert_eq!(ProxyKind::from_setting("SOCKS5"), ProxyKind::Socks5);
    assert_eq!(ProxyKind::from_setting("http"), ProxyKind::Http);
    assert_eq!(ProxyKind::from_setting("None"), ProxyKind::None);
    assert_eq!(ProxyKind::from_setting("garbage"), ProxyKind::None);
  }

  #[test]
  fn settings_provider_reads_privacy_section() {
    let store = SettingsStore::from_value(json!({
      "privacy": {
        "relay_enabled": true,
        "relay_port": 9150,
        "proxy_type": "socks5",
        "proxy_address": "10.0.0.1",
        "proxy_port": 1080,
      },
    }));
    let provider = SettingsPrivacyProvider::new(store);
    assert!(provider.relay_enabled());
    assert_eq!(provider.relay_settings().port, 9150);
    assert_eq!(provider.relay_settings().address, "127.0.0.1");
    let proxy = provider.proxy_settings();
    assert_eq!(proxy.kind, ProxyKind::Socks5);
    assert_eq!(proxy.address, "10.0.0.1");
    assert_eq!(proxy.port, 1080);
  }

  #[test]
  fn defaults_report_relay_disabled() {
    let provider = SettingsPrivacyProvider::new(SettingsStore::with_defaults());
    assert!(!provider.relay_enabled());
    assert!(!provider.request_new_circuit());
    assert_eq!(provider.proxy_settings().kind, ProxyKind::None);
  }
}
