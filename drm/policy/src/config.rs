use core::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};

/**
    Prefix of environment variables that override settings.
*/
pub const ENV_PREFIX: &str = "DRM_POLICY_";

/**
    Raw named settings, as read from a configuration file.

    Every field is optional here; [`Settings::resolve`] reports the
    first required one that is missing instead of falling back to a
    default.
*/
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    // JWT restriction
    pub jwt_restriction_primary_verification_key: Option<String>,
    pub jwt_restriction_audience: Option<String>,
    pub jwt_restriction_issuer: Option<String>,

    // Common encryption (Widevine + PlayReady)
    pub common_encryption_authorization_policy_name: Option<String>,
    pub widevine_authorization_policy_option_name: Option<String>,
    pub widevine_license_template_path: Option<String>,
    pub playready_authorization_policy_option_name: Option<String>,
    pub playready_license_template_path: Option<String>,
    pub dynamic_common_encryption_delivery_policy_name: Option<String>,

    // Common encryption CBCS (FairPlay)
    pub fairplay_enabled: Option<bool>,
    pub common_encryption_cbcs_authorization_policy_name: Option<String>,
    pub fairplay_authorization_policy_option_name: Option<String>,
    pub dynamic_common_encryption_cbcs_delivery_policy_name: Option<String>,
    pub fairplay_ask_content_key_name: Option<String>,
    pub fairplay_ask_hexadecimal: Option<String>,
    pub fairplay_app_cert_password_content_key_name: Option<String>,
    pub fairplay_app_cert_password: Option<String>,
    pub fairplay_app_cert_path: Option<String>,
}

/**
    Reads the files settings point at. The core never touches the
    filesystem itself.
*/
pub trait FileSource {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

impl Settings {
    /**
        Apply `DRM_POLICY_<SETTING>` overrides from `vars`.

        Unrelated variables are ignored. `fairplay_enabled` must be
        exactly `true` or `false`.
    */
    pub fn merge_env<I, K, V>(&mut self, vars: I) -> PolicyResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let name = name.to_ascii_lowercase();
            let value = value.into();
            let slot = match name.as_str() {
                "fairplay_enabled" => {
                    self.fairplay_enabled = Some(parse_bool("fairplay_enabled", &value)?);
                    continue;
                }
                "jwt_restriction_primary_verification_key" => {
                    &mut self.jwt_restriction_primary_verification_key
                }
                "jwt_restriction_audience" => &mut self.jwt_restriction_audience,
                "jwt_restriction_issuer" => &mut self.jwt_restriction_issuer,
                "common_encryption_authorization_policy_name" => {
                    &mut self.common_encryption_authorization_policy_name
                }
                "widevine_authorization_policy_option_name" => {
                    &mut self.widevine_authorization_policy_option_name
                }
                "widevine_license_template_path" => &mut self.widevine_license_template_path,
                "playready_authorization_policy_option_name" => {
                    &mut self.playready_authorization_policy_option_name
                }
                "playready_license_template_path" => &mut self.playready_license_template_path,
                "dynamic_common_encryption_delivery_policy_name" => {
                    &mut self.dynamic_common_encryption_delivery_policy_name
                }
                "common_encryption_cbcs_authorization_policy_name" => {
                    &mut self.common_encryption_cbcs_authorization_policy_name
                }
                "fairplay_authorization_policy_option_name" => {
                    &mut self.fairplay_authorization_policy_option_name
                }
                "dynamic_common_encryption_cbcs_delivery_policy_name" => {
                    &mut self.dynamic_common_encryption_cbcs_delivery_policy_name
                }
                "fairplay_ask_content_key_name" => &mut self.fairplay_ask_content_key_name,
                "fairplay_ask_hexadecimal" => &mut self.fairplay_ask_hexadecimal,
                "fairplay_app_cert_password_content_key_name" => {
                    &mut self.fairplay_app_cert_password_content_key_name
                }
                "fairplay_app_cert_password" => &mut self.fairplay_app_cert_password,
                "fairplay_app_cert_path" => &mut self.fairplay_app_cert_path,
                _ => continue,
            };
            *slot = Some(value);
        }
        Ok(())
    }

    /**
        Turn raw settings into a typed [`ReconcileConfig`], loading the
        license templates and FairPlay certificate through `files`.

        FairPlay settings are only read when `fairplay_enabled` is true.
    */
    pub fn resolve(&self, files: &dyn FileSource) -> PolicyResult<ReconcileConfig> {
        let jwt = JwtConfig {
            verification_key: require(
                "jwt_restriction_primary_verification_key",
                &self.jwt_restriction_primary_verification_key,
            )?,
            audience: require("jwt_restriction_audience", &self.jwt_restriction_audience)?,
            issuer: require("jwt_restriction_issuer", &self.jwt_restriction_issuer)?,
        };

        let cenc = CencConfig {
            authorization_policy_name: require(
                "common_encryption_authorization_policy_name",
                &self.common_encryption_authorization_policy_name,
            )?,
            widevine_option_name: require(
                "widevine_authorization_policy_option_name",
                &self.widevine_authorization_policy_option_name,
            )?,
            widevine_template: load_text(
                files,
                "widevine_license_template_path",
                &self.widevine_license_template_path,
            )?,
            playready_option_name: require(
                "playready_authorization_policy_option_name",
                &self.playready_authorization_policy_option_name,
            )?,
            playready_template: load_text(
                files,
                "playready_license_template_path",
                &self.playready_license_template_path,
            )?,
            delivery_policy_name: require(
                "dynamic_common_encryption_delivery_policy_name",
                &self.dynamic_common_encryption_delivery_policy_name,
            )?,
        };

        let fairplay_enabled = self
            .fairplay_enabled
            .ok_or(PolicyError::ConfigurationMissing("fairplay_enabled"))?;

        let cbcs = if fairplay_enabled {
            Some(self.resolve_cbcs(files)?)
        } else {
            None
        };

        Ok(ReconcileConfig { jwt, cenc, cbcs })
    }

    fn resolve_cbcs(&self, files: &dyn FileSource) -> PolicyResult<CbcsConfig> {
        let ask_hex = require("fairplay_ask_hexadecimal", &self.fairplay_ask_hexadecimal)?;
        let ask = hex::decode(ask_hex.trim())
            .map_err(|e| PolicyError::InvalidKeyMaterial(format!("fairplay_ask_hexadecimal: {e}")))?;
        if ask.is_empty() {
            return Err(PolicyError::InvalidKeyMaterial(
                "fairplay_ask_hexadecimal is empty".into(),
            ));
        }

        let cert_path = require("fairplay_app_cert_path", &self.fairplay_app_cert_path)?;
        let certificate =
            files
                .read(Path::new(&cert_path))
                .map_err(|e| PolicyError::InvalidConfiguration {
                    name: "fairplay_app_cert_path",
                    reason: format!("{cert_path}: {e}"),
                })?;

        Ok(CbcsConfig {
            authorization_policy_name: require(
                "common_encryption_cbcs_authorization_policy_name",
                &self.common_encryption_cbcs_authorization_policy_name,
            )?,
            option_name: require(
                "fairplay_authorization_policy_option_name",
                &self.fairplay_authorization_policy_option_name,
            )?,
            delivery_policy_name: require(
                "dynamic_common_encryption_cbcs_delivery_policy_name",
                &self.dynamic_common_encryption_cbcs_delivery_policy_name,
            )?,
            ask_key_name: require(
                "fairplay_ask_content_key_name",
                &self.fairplay_ask_content_key_name,
            )?,
            ask,
            certificate_password_key_name: require(
                "fairplay_app_cert_password_content_key_name",
                &self.fairplay_app_cert_password_content_key_name,
            )?,
            certificate_password: require(
                "fairplay_app_cert_password",
                &self.fairplay_app_cert_password,
            )?,
            certificate,
        })
    }
}

fn require(name: &'static str, value: &Option<String>) -> PolicyResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.clone()),
        _ => Err(PolicyError::ConfigurationMissing(name)),
    }
}

fn load_text(
    files: &dyn FileSource,
    name: &'static str,
    path: &Option<String>,
) -> PolicyResult<String> {
    let path = require(name, path)?;
    files
        .read_to_string(Path::new(&path))
        .map_err(|e| PolicyError::InvalidConfiguration {
            name,
            reason: format!("{path}: {e}"),
        })
}

fn parse_bool(name: &'static str, value: &str) -> PolicyResult<bool> {
    match value.trim() {
        "true" | "True" | "TRUE" => Ok(true),
        "false" | "False" | "FALSE" => Ok(false),
        other => Err(PolicyError::InvalidConfiguration {
            name,
            reason: format!("expected true or false, got '{other}'"),
        }),
    }
}

// ── Resolved configuration ──────────────────────────────────────────

/**
    Desired state for one reconciliation run.

    `cbcs` is `None` when FairPlay is switched off.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub jwt: JwtConfig,
    pub cenc: CencConfig,
    pub cbcs: Option<CbcsConfig>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct JwtConfig {
    /// Base64url-encoded symmetric verification key.
    pub verification_key: String,
    pub audience: String,
    pub issuer: String,
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("verification_key", &"<redacted>")
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CencConfig {
    pub authorization_policy_name: String,
    pub widevine_option_name: String,
    pub widevine_template: String,
    pub playready_option_name: String,
    pub playready_template: String,
    pub delivery_policy_name: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct CbcsConfig {
    pub authorization_policy_name: String,
    pub option_name: String,
    pub delivery_policy_name: String,
    pub ask_key_name: String,
    /// Application secret key, already hex-decoded.
    pub ask: Vec<u8>,
    pub certificate_password_key_name: String,
    pub certificate_password: String,
    /// Opaque PKCS#12 bundle.
    pub certificate: Vec<u8>,
}

impl fmt::Debug for CbcsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CbcsConfig")
            .field("authorization_policy_name", &self.authorization_policy_name)
            .field("option_name", &self.option_name)
            .field("delivery_policy_name", &self.delivery_policy_name)
            .field("ask_key_name", &self.ask_key_name)
            .field("ask", &"<redacted>")
            .field(
                "certificate_password_key_name",
                &self.certificate_password_key_name,
            )
            .field("certificate_password", &"<redacted>")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::*;

    struct MapFiles(HashMap<PathBuf, Vec<u8>>);

    impl FileSource for MapFiles {
        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            let bytes = self.read(path)?;
            String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        }

        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
        }
    }

    fn files() -> MapFiles {
        MapFiles(HashMap::from([
            (PathBuf::from("widevine.json"), b"{\"allowed_track_types\":\"SD_HD\"}".to_vec()),
            (PathBuf::from("playready.xml"), b"<PlayReadyLicenseResponseTemplate/>".to_vec()),
            (PathBuf::from("fairplay.pfx"), vec![0x30, 0x82, 0x01]),
        ]))
    }

    const YAML: &str = r#"
jwt_restriction_primary_verification_key: AAECAwQFBgcICQoLDA0ODw
jwt_restriction_audience: urn:player
jwt_restriction_issuer: https://issuer.example
common_encryption_authorization_policy_name: cenc-authorization
widevine_authorization_policy_option_name: widevine-option
widevine_license_template_path: widevine.json
playready_authorization_policy_option_name: playready-option
playready_license_template_path: playready.xml
dynamic_common_encryption_delivery_policy_name: cenc-delivery
fairplay_enabled: true
common_encryption_cbcs_authorization_policy_name: cbcs-authorization
fairplay_authorization_policy_option_name: fairplay-option
dynamic_common_encryption_cbcs_delivery_policy_name: cbcs-delivery
fairplay_ask_content_key_name: fairplay-ask
fairplay_ask_hexadecimal: 000102030405060708090A0B0C0D0E0F
fairplay_app_cert_password_content_key_name: fairplay-pfx-password
fairplay_app_cert_password: hunter2
fairplay_app_cert_path: fairplay.pfx
"#;

    fn settings() -> Settings {
        serde_yaml::from_str(YAML).unwrap()
    }

    #[test]
    fn resolves_full_settings() {
        let config = settings().resolve(&files()).unwrap();
        assert_eq!(config.cenc.widevine_option_name, "widevine-option");
        assert_eq!(config.cenc.playready_template, "<PlayReadyLicenseResponseTemplate/>");
        let cbcs = config.cbcs.unwrap();
        assert_eq!(cbcs.ask, (0u8..16).collect::<Vec<_>>());
        assert_eq!(cbcs.certificate, vec![0x30, 0x82, 0x01]);
        assert_eq!(cbcs.certificate_password, "hunter2");
    }

    #[test]
    fn disabled_fairplay_skips_fairplay_settings() {
        let mut s = settings();
        s.fairplay_enabled = Some(false);
        s.fairplay_app_cert_path = None;
        s.fairplay_ask_hexadecimal = None;
        let config = s.resolve(&files()).unwrap();
        assert!(config.cbcs.is_none());
    }

    #[test]
    fn missing_switch_is_reported_not_defaulted() {
        let mut s = settings();
        s.fairplay_enabled = None;
        let err = s.resolve(&files()).unwrap_err();
        assert!(matches!(err, PolicyError::ConfigurationMissing("fairplay_enabled")));
    }

    #[test]
    fn missing_required_name_is_reported() {
        let mut s = settings();
        s.fairplay_ask_content_key_name = Some("   ".into());
        let err = s.resolve(&files()).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::ConfigurationMissing("fairplay_ask_content_key_name")
        ));
    }

    #[test]
    fn unreadable_template_is_invalid_configuration() {
        let mut s = settings();
        s.widevine_license_template_path = Some("missing.json".into());
        let err = s.resolve(&files()).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::InvalidConfiguration { name: "widevine_license_template_path", .. }
        ));
    }

    #[test]
    fn bad_ask_hex_is_invalid_key_material() {
        let mut s = settings();
        s.fairplay_ask_hexadecimal = Some("xyz".into());
        let err = s.resolve(&files()).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn env_overrides_settings() {
        let mut s = settings();
        s.merge_env([
            ("DRM_POLICY_JWT_RESTRICTION_AUDIENCE", "urn:other"),
            ("DRM_POLICY_FAIRPLAY_ENABLED", "false"),
            ("PATH", "/usr/bin"),
            ("DRM_POLICY_UNKNOWN", "ignored"),
        ])
        .unwrap();
        assert_eq!(s.jwt_restriction_audience.as_deref(), Some("urn:other"));
        assert_eq!(s.fairplay_enabled, Some(false));
    }

    #[test]
    fn env_switch_must_be_boolean() {
        let mut s = settings();
        let err = s
            .merge_env([("DRM_POLICY_FAIRPLAY_ENABLED", "yes")])
            .unwrap_err();
        assert!(matches!(
            err,
            PolicyError::InvalidConfiguration { name: "fairplay_enabled", .. }
        ));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = settings().resolve(&files()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("AAECAwQFBgcICQoLDA0ODw"));
    }
}
