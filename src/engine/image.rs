use bollard::body_full;
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateImageOptionsBuilder, RemoveImageOptionsBuilder,
    TagImageOptionsBuilder,
};
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::engine::build::{BuildContext, ENTRYPOINT_FILE};
use crate::error::{CmdletError, Result};
use crate::plan::ResourcePlan;

/// Builds or pulls a command's image and tags it `<owner>-<name>`.
///
/// Both operations are synchronous from the caller's point of view and
/// idempotent at the tag: re-running simply re-tags.
pub struct ImageProvider {
    docker: Docker,
}

impl ImageProvider {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Archive the build context and submit it to the engine's build API.
    /// All build output is drained before returning so a success return
    /// means the build actually completed; the first error wins.
    pub async fn build(&self, cmd: &Command, ctx: &BuildContext) -> Result<String> {
        let tag = cmd.image_tag();
        let archive = archive_context(ctx)?;

        info!(tag = %tag, image = %ctx.image, "Building command image");

        let options = BuildImageOptionsBuilder::new()
            .dockerfile("Dockerfile")
            .t(&tag)
            .rm(true)
            .build();

        let mut output = self
            .docker
            .build_image(options, None, Some(body_full(archive.into())));

        let mut first_error: Option<CmdletError> = None;
        while let Some(update) = output.next().await {
            match update {
                Ok(info) => {
                    if let Some(message) = info.stream {
                        let message = message.trim_end();
                        if !message.is_empty() {
                            debug!(tag = %tag, "{message}");
                        }
                    }
                    if let Some(error) = info.error {
                        first_error.get_or_insert(CmdletError::Build(error));
                    }
                }
                Err(err) => {
                    first_error.get_or_insert(err.into());
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(tag),
        }
    }

    /// Pull the raw source reference, enforce the plan's image-size ceiling,
    /// and tag the result. An oversized image is removed before failing.
    pub async fn pull(&self, cmd: &Command, plan: &ResourcePlan) -> Result<String> {
        let reference = cmd.source.trim();
        let (from_image, pull_tag) = match reference.rsplit_once(':') {
            Some((image, tag)) => (image, tag),
            None => (reference, "latest"),
        };

        info!(reference = %reference, "Pulling command image");

        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(pull_tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;

        let inspected = self.docker.inspect_image(reference).await?;
        let size = inspected.size.unwrap_or(0);
        if image_too_large(size, plan.max_image_size) {
            if let Err(err) = self
                .docker
                .remove_image(
                    reference,
                    Some(RemoveImageOptionsBuilder::new().force(true).build()),
                    None,
                )
                .await
            {
                warn!(reference = %reference, error = %err, "Failed to remove oversized image");
            }
            return Err(CmdletError::ImageTooLarge {
                size,
                limit: plan.max_image_size,
            });
        }

        let tag = cmd.image_tag();
        self.docker
            .tag_image(
                reference,
                Some(TagImageOptionsBuilder::new().repo(&tag).tag("latest").build()),
            )
            .await?;
        Ok(tag)
    }
}

/// The ceiling is inclusive: an image at exactly the limit is allowed.
fn image_too_large(size: i64, limit: i64) -> bool {
    size > limit
}

/// Pack the resolver's file map into a tar stream the build API accepts.
/// The embedded entrypoint must be executable; COPY preserves tar modes.
fn archive_context(ctx: &BuildContext) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in &ctx.files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(if name == ENTRYPOINT_FILE { 0o755 } else { 0o644 });
        header.set_cksum();
        builder.append_data(&mut header, name, content.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::build::{resolve, ResolvedSource};

    fn context(source: &str) -> BuildContext {
        match resolve(source).unwrap() {
            ResolvedSource::Script(ctx) => ctx,
            other => panic!("expected script, got {other:?}"),
        }
    }

    #[test]
    fn size_ceiling_is_strictly_greater() {
        assert!(image_too_large(1001, 1000));
        assert!(!image_too_large(1000, 1000));
        assert!(!image_too_large(999, 1000));
    }

    #[test]
    fn archive_contains_manifest_and_executable_entrypoint() {
        let archive = archive_context(&context("#!cmd alpine\n#!/bin/sh\necho hi")).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let mut seen = Vec::new();
        for entry in reader.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mode = entry.header().mode().unwrap();
            seen.push((path, mode));
        }
        assert!(seen.contains(&("Dockerfile".to_string(), 0o644)));
        assert!(seen.contains(&("entrypoint".to_string(), 0o755)));
    }

    #[test]
    fn archive_without_entrypoint_has_only_manifest() {
        let archive = archive_context(&context("#!cmd alpine\n#!/bin/sh\n")).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["Dockerfile"]);
    }
}
