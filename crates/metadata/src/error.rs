use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("failed to read environment file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid environment YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid environment: {0}")]
    Validation(String),
}
