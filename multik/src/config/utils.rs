use std::{
    fs,
    path::{Path, PathBuf},
};

use base64::Engine;

use crate::error::ConfigError;

/// Returns the kubeconfig path from `$KUBECONFIG` or `$HOME/.kube/config`.
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    std::env::var_os("KUBECONFIG")
        .map(PathBuf::from)
        .or_else(|| home::home_dir().map(|h| h.join(".kube").join("config")))
}

/// Resolve inline base64 data or a referenced file, data taking precedence.
pub fn data_or_file(
    data: &Option<String>,
    file: &Option<String>,
    what: &'static str,
) -> Result<Vec<u8>, ConfigError> {
    match (data, file) {
        (Some(d), _) => base64::engine::general_purpose::STANDARD
            .decode(d.trim())
            .map_err(ConfigError::Base64Decode),
        (_, Some(f)) => read_file(f),
        _ => Err(ConfigError::NoFileOrData(what)),
    }
}

pub fn read_file<P: AsRef<Path>>(file: P) -> Result<Vec<u8>, ConfigError> {
    fs::read(&file).map_err(|source| ConfigError::ReadFile {
        path: file.as_ref().into(),
        source,
    })
}

pub fn read_file_to_string<P: AsRef<Path>>(file: P) -> Result<String, ConfigError> {
    fs::read_to_string(&file).map_err(|source| ConfigError::ReadFile {
        path: file.as_ref().into(),
        source,
    })
}

/// Split a PEM bundle into DER certificates, dropping non-certificate blocks.
pub fn certs(data: &[u8]) -> Result<Vec<Vec<u8>>, ConfigError> {
    Ok(pem::parse_many(data)
        .map_err(ConfigError::ParseCertificates)?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(pem::Pem::into_contents)
        .collect())
}
