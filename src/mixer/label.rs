//! Human-readable labels for objects, built from their property lists.

use super::types::{ObjectKind, Properties};

/// Media names some clients use that say nothing about the stream
const PLACEHOLDER_NAMES: &[&str] = &["audio stream", "AudioStream"];

const STREAM_DETAIL: &[&str] = &[
    "application.process.user",
    "application.process.host",
    "application.process.id",
];
const DEVICE_DETAIL: &[&str] = &["device.profile.name", "alsa.driver_name"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Naming {
    /// Prefer `media.name` over the application name for streams
    pub use_media_name: bool,
    /// Prefer `device.description` over ALSA ids for devices
    pub use_device_name: bool,
}

/// Builds labels and hands out the ` #n` suffixes used to tell otherwise
/// identical names apart.
#[derive(Debug, Default)]
pub struct Labeler {
    naming: Naming,
    next_unique: u32,
}

impl Labeler {
    pub fn new(naming: Naming) -> Self {
        Self {
            naming,
            next_unique: 0,
        }
    }

    pub fn unique(&mut self, name: &str) -> String {
        let n = self.next_unique;
        self.next_unique = (self.next_unique + 1) % (1 << 30);
        format!("{} #{}", name, n)
    }

    pub fn label(&mut self, kind: ObjectKind, props: &Properties) -> String {
        match kind {
            ObjectKind::Stream => self.stream_label(props),
            ObjectKind::Sink => self.device_label(props),
        }
    }

    fn stream_label(&mut self, props: &Properties) -> String {
        if self.naming.use_media_name
            && let Some(name) = props.get("media.name")
            && !PLACEHOLDER_NAMES.contains(&name.as_str())
        {
            return name.clone();
        }

        let name = match props.get("application.name") {
            Some(name) => name.clone(),
            None => {
                let base = props.get("media.name").map(String::as_str).unwrap_or("stream");
                self.unique(base)
            }
        };
        with_detail(name, props, STREAM_DETAIL, |v| format!("({}@{}:{})", v[0], v[1], v[2]))
    }

    fn device_label(&mut self, props: &Properties) -> String {
        let description = props.get("device.description");

        let name = if self.naming.use_device_name
            && let Some(desc) = description
        {
            desc.clone()
        } else if let Some(id) = props.get("alsa.id") {
            id.clone()
        } else if let (Some(api), Some(string)) =
            (props.get("device.api"), props.get("device.string"))
        {
            format!("{}.{}", api, string)
        } else {
            let base = description.map(String::as_str).unwrap_or("device");
            self.unique(base)
        };
        with_detail(name, props, DEVICE_DETAIL, |v| format!("({}@{})", v[0], v[1]))
    }
}

/// Append a detail suffix, but only when every key it needs is present.
fn with_detail(
    name: String,
    props: &Properties,
    keys: &[&str],
    render: impl Fn(&[&str]) -> String,
) -> String {
    let values: Option<Vec<&str>> = keys
        .iter()
        .map(|k| props.get(*k).map(String::as_str))
        .collect();
    match values {
        Some(values) => format!("{} {}", name, render(&values)),
        None => name,
    }
}
