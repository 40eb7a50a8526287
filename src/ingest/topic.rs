//! Topic parsing: `base/user/device[/rest...]`.

use crate::storage::log::BASE_RELTOPIC;

/// Components of a publish topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    /// `base/user/device`, without a leading slash.
    pub base_topic: String,
    pub user: String,
    pub device: String,
    /// Whatever follows the base topic, `*` for the base topic itself.
    pub reltopic: String,
}

/// Split `topic` into its parts. A leading `/` is tolerated; fewer than three
/// segments yields `None`.
pub fn parse_topic(topic: &str) -> Option<TopicParts> {
    let trimmed = topic.strip_prefix('/').unwrap_or(topic);
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.len() < 3 {
        return None;
    }

    let (base, user, device) = (segments[0], segments[1], segments[2]);
    if user.is_empty() || device.is_empty() {
        return None;
    }

    let reltopic = if segments.len() == 3 {
        BASE_RELTOPIC.to_string()
    } else {
        let rest = segments[3..].join("/");
        if rest.is_empty() {
            "-".to_string()
        } else {
            rest
        }
    };

    Some(TopicParts {
        base_topic: format!("{base}/{user}/{device}"),
        user: user.to_string(),
        device: device.to_string(),
        reltopic,
    })
}
