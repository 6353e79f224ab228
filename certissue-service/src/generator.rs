//! Certificate artifact generation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use certissue_core::{Catalog, FullName, Gender, OfferingId, Serial};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("Unknown offering: {0}")]
    UnknownOffering(OfferingId),

    #[error("Failed to write artifact: {0}")]
    Io(String),
}

/// A rendered certificate on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub serial: Serial,
    pub template_ref: String,
    /// Re-issued from an existing binding
    pub copy: bool,
}

#[async_trait]
pub trait CertificateGenerator: Send + Sync {
    /// Render a new certificate
    async fn generate(
        &self,
        full_name: &FullName,
        gender: Gender,
        offering: &OfferingId,
        serial: Serial,
    ) -> Result<Artifact, GenerationError>;

    /// Re-render an already issued certificate, marked as a copy
    async fn generate_copy(
        &self,
        template_ref: &str,
        full_name: &FullName,
        serial: Serial,
    ) -> Result<Artifact, GenerationError>;
}

/// Writes plain-text certificates into a directory
pub struct TextCertificateGenerator {
    output_dir: PathBuf,
    catalog: Arc<Catalog>,
    /// Stamp every certificate as a test version
    watermark: bool,
}

impl TextCertificateGenerator {
    pub fn new(output_dir: impl AsRef<Path>, catalog: Arc<Catalog>, watermark: bool) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            catalog,
            watermark,
        }
    }

    fn render(
        &self,
        title: &str,
        template_ref: &str,
        full_name: &FullName,
        serial: Serial,
        copy: bool,
    ) -> String {
        let mut body = String::new();
        body.push_str("CERTIFICATE OF COMPLETION\n");
        body.push_str(&format!("No. {}\n\n", serial));
        body.push_str(&format!("{}\n", full_name));
        if !title.is_empty() {
            body.push_str(&format!("has completed \"{}\"\n", title));
        }
        body.push_str(&format!("\ntemplate: {}\n", template_ref));
        if copy {
            body.push_str("COPY\n");
        }
        if self.watermark {
            body.push_str("TEST VERSION\n");
        }
        body
    }

    async fn write(&self, serial: Serial, body: String) -> Result<PathBuf, GenerationError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| GenerationError::Io(e.to_string()))?;
        let path = self
            .output_dir
            .join(format!("certificate-{}-{}.txt", serial, Uuid::new_v4().simple()));
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| GenerationError::Io(e.to_string()))?;
        Ok(path)
    }
}

#[async_trait]
impl CertificateGenerator for TextCertificateGenerator {
    async fn generate(
        &self,
        full_name: &FullName,
        gender: Gender,
        offering: &OfferingId,
        serial: Serial,
    ) -> Result<Artifact, GenerationError> {
        let entry = self
            .catalog
            .get(offering)
            .ok_or_else(|| GenerationError::UnknownOffering(offering.clone()))?;
        let template_ref = entry.template_for(gender);
        let body = self.render(&entry.title, &template_ref, full_name, serial, false);
        let path = self.write(serial, body).await?;

        tracing::info!(
            serial = %serial,
            template = %template_ref,
            path = %path.display(),
            "Certificate generated"
        );
        Ok(Artifact {
            path,
            serial,
            template_ref,
            copy: false,
        })
    }

    async fn generate_copy(
        &self,
        template_ref: &str,
        full_name: &FullName,
        serial: Serial,
    ) -> Result<Artifact, GenerationError> {
        let title = self
            .catalog
            .offerings()
            .iter()
            .find(|o| o.templates.values().any(|t| t == template_ref))
            .map(|o| o.title.as_str())
            .unwrap_or_default();
        let body = self.render(title, template_ref, full_name, serial, true);
        let path = self.write(serial, body).await?;

        tracing::info!(serial = %serial, template = %template_ref, "Certificate copy generated");
        Ok(Artifact {
            path,
            serial,
            template_ref: template_ref.to_string(),
            copy: true,
        })
    }
}
