//! IaC templates embedded at build time

use std::path::Path;

use constellation_common::fs::atomic_write;
use constellation_common::{CloudProvider, Error, Result};

/// One template file
#[derive(Clone, Copy, Debug)]
pub struct TemplateFile {
    /// File name inside the workspace
    pub name: &'static str,
    /// File contents
    pub contents: &'static str,
}

/// The three files of one template
#[derive(Clone, Copy, Debug)]
pub struct Template {
    /// Human readable name for logs
    pub name: &'static str,
    /// `main.tf`, `variables.tf`, `outputs.tf`
    pub files: [TemplateFile; 3],
}

macro_rules! template {
    ($name:expr, $dir:literal) => {
        Template {
            name: $name,
            files: [
                TemplateFile {
                    name: "main.tf",
                    contents: include_str!(concat!("../terraform/", $dir, "/main.tf")),
                },
                TemplateFile {
                    name: "variables.tf",
                    contents: include_str!(concat!("../terraform/", $dir, "/variables.tf")),
                },
                TemplateFile {
                    name: "outputs.tf",
                    contents: include_str!(concat!("../terraform/", $dir, "/outputs.tf")),
                },
            ],
        }
    };
}

const AWS: Template = template!("aws", "aws");
const AZURE: Template = template!("azure", "azure");
const GCP: Template = template!("gcp", "gcp");
const OPENSTACK: Template = template!("openstack", "openstack");
const QEMU: Template = template!("qemu", "qemu");
const IAM_AWS: Template = template!("iam-aws", "iam/aws");
const IAM_AZURE: Template = template!("iam-azure", "iam/azure");
const IAM_GCP: Template = template!("iam-gcp", "iam/gcp");

/// Cluster template of `provider`
pub fn template_for(provider: CloudProvider) -> Template {
    match provider {
        CloudProvider::Aws => AWS,
        CloudProvider::Azure => AZURE,
        CloudProvider::Gcp => GCP,
        CloudProvider::OpenStack => OPENSTACK,
        CloudProvider::Qemu => QEMU,
    }
}

/// IAM template of `provider`
pub fn iam_template_for(provider: CloudProvider) -> Result<Template> {
    match provider {
        CloudProvider::Aws => Ok(IAM_AWS),
        CloudProvider::Azure => Ok(IAM_AZURE),
        CloudProvider::Gcp => Ok(IAM_GCP),
        other => Err(Error::config_validation(format!(
            "IAM resources cannot be created on {}",
            other
        ))),
    }
}

impl Template {
    /// Write every file into `dir`, replacing existing copies
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        for file in &self.files {
            atomic_write(&dir.join(file.name), file.contents.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn every_cluster_template_declares_the_read_outputs() {
        for provider in CloudProvider::ALL {
            let template = template_for(provider);
            let outputs = template.files[2].contents;
            for name in ["\"ip\"", "\"api_server_cert_sans\"", "\"uid\"", "\"initSecret\""] {
                assert!(outputs.contains(name), "{} lacks output {}", template.name, name);
            }
        }
        assert!(template_for(CloudProvider::Azure).files[2]
            .contents
            .contains("\"attestationURL\""));
    }

    #[test]
    fn iam_templates_exist_only_for_supported_providers() {
        for provider in CloudProvider::ALL {
            assert_eq!(iam_template_for(provider).is_ok(), provider.supports_iam());
        }
        assert!(iam_template_for(CloudProvider::Gcp).unwrap().files[2]
            .contents
            .contains("sa_key"));
    }

    #[test]
    fn write_to_overwrites_existing_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("main.tf"), "stale").unwrap();
        template_for(CloudProvider::Qemu).write_to(tmp.path()).unwrap();
        let main = std::fs::read_to_string(tmp.path().join("main.tf")).unwrap();
        assert!(main.contains("dmacvicar/libvirt"));
        assert!(tmp.path().join("variables.tf").exists());
        assert!(tmp.path().join("outputs.tf").exists());
    }
}
