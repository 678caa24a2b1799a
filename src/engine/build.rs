use std::collections::BTreeMap;

use crate::error::{CmdletError, Result};

/// Marker that identifies a buildable script source.
pub const SCRIPT_MARKER: &str = "#!cmd";

/// The only base image family the script compiler currently supports.
const SUPPORTED_BASE: &str = "alpine";

/// Where an embedded entrypoint script lands inside the image.
pub const ENTRYPOINT_PATH: &str = "/cmd/entrypoint";

/// Build-context name of the embedded entrypoint script.
pub const ENTRYPOINT_FILE: &str = "entrypoint";

/// How a command's source text turns into a runnable image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// Plain image reference; resolved by pulling.
    Image(String),
    /// `#!cmd` script; resolved by building the synthesized context.
    Script(BuildContext),
}

/// A synthesized build context: the parsed header plus the files to archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub image: String,
    pub packages: Vec<String>,
    /// File name to byte content. Always contains `Dockerfile`; optionally
    /// the embedded [`ENTRYPOINT_FILE`].
    pub files: BTreeMap<String, Vec<u8>>,
}

/// Decide whether `source` is a pull-able image reference or a script, and
/// compile the script case into a build context.
///
/// A single line with no `#!` prefix is an image reference. Anything
/// script-shaped must carry the `#!cmd <image> [pkg ...]` header on its first
/// line; other script sources are input errors.
pub fn resolve(source: &str) -> Result<ResolvedSource> {
    if !source.contains('\n') && !source.starts_with("#!") {
        let image = source.trim();
        if image.is_empty() {
            return Err(CmdletError::InvalidSource {
                reason: "empty source".to_string(),
            });
        }
        return Ok(ResolvedSource::Image(image.to_string()));
    }
    Ok(ResolvedSource::Script(compile(source)?))
}

/// Compile a `#!cmd` script into a build context.
fn compile(source: &str) -> Result<BuildContext> {
    let (header, body) = split_first_line(source);

    let mut tokens = header.split_whitespace();
    if tokens.next() != Some(SCRIPT_MARKER) {
        return Err(CmdletError::InvalidSource {
            reason: format!("first line must be `{SCRIPT_MARKER} <image> [pkg ...]`"),
        });
    }
    let image = tokens.next().ok_or_else(|| CmdletError::InvalidSource {
        reason: format!("`{SCRIPT_MARKER}` header is missing a base image"),
    })?;
    let packages: Vec<String> = tokens.map(str::to_string).collect();

    if image != SUPPORTED_BASE && !image.starts_with(&format!("{SUPPORTED_BASE}:")) {
        return Err(CmdletError::UnsupportedImage {
            image: image.to_string(),
        });
    }

    let mut files = BTreeMap::new();
    let entrypoint = resolve_entrypoint(body, &mut files);

    let mut manifest = format!("FROM {image}\n");
    if !packages.is_empty() {
        manifest.push_str(&format!("RUN apk --no-cache add {}\n", packages.join(" ")));
    }
    if files.contains_key(ENTRYPOINT_FILE) {
        manifest.push_str(&format!("COPY {ENTRYPOINT_FILE} {ENTRYPOINT_PATH}\n"));
    }
    manifest.push_str("WORKDIR /cmd\n");
    manifest.push_str(&format!(
        "ENTRYPOINT {}\n",
        serde_json::to_string(&entrypoint)?
    ));
    files.insert("Dockerfile".to_string(), manifest.into_bytes());

    Ok(BuildContext {
        image: image.to_string(),
        packages,
        files,
    })
}

/// Derive the entrypoint from the script body, embedding the body as an
/// executable file when it carries more than the interpreter line.
fn resolve_entrypoint(body: &str, files: &mut BTreeMap<String, Vec<u8>>) -> Vec<String> {
    if body.is_empty() {
        // A bare header still builds; the image supplies no entrypoint.
        return Vec::new();
    }
    let (first_line, rest) = split_first_line(body);
    if let Some(interpreter) = first_line.strip_prefix("#!") {
        if rest.is_empty() {
            return interpreter.split_whitespace().map(str::to_string).collect();
        }
    }
    // Multi-line body (or one without an interpreter line): embed it verbatim
    // and point the entrypoint at the fixed in-image path.
    files.insert(ENTRYPOINT_FILE.to_string(), body.as_bytes().to_vec());
    vec![ENTRYPOINT_PATH.to_string()]
}

fn split_first_line(text: &str) -> (&str, &str) {
    match text.split_once('\n') {
        Some((line, rest)) => (line, rest),
        None => (text, ""),
    }
}
