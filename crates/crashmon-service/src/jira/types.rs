use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, de};

/// Timestamp format of the Jira REST API, e.g. `2019-01-10T11:31:53.000+0300`.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

#[derive(Clone, Debug, Deserialize)]
pub struct Issue {
    pub key: String,
    #[serde(default)]
    pub fields: IssueFields,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IssueFields {
    pub status: Option<Named>,
    pub fix_versions: Vec<Named>,
    pub versions: Vec<Named>,
    #[serde(rename = "attachment")]
    pub attachments: Vec<Attachment>,
    pub summary: String,
    pub description: Option<String>,
    pub components: Vec<Named>,
}

impl IssueFields {
    pub fn status_name(&self) -> Option<&str> {
        self.status.as_ref().map(|status| status.name.as_str())
    }
}

/// Any named entity: status, version, component.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Named {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    #[serde(deserialize_with = "deserialize_time")]
    pub created: DateTime<FixedOffset>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Transition {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct Transitions {
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreatedIssue {
    pub key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub start_at: usize,
    pub max_results: usize,
    pub total: usize,
    pub issues: Vec<Issue>,
}

fn deserialize_time<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<DateTime<FixedOffset>, D::Error> {
    let value = String::deserialize(deserializer)?;
    DateTime::parse_from_str(&value, TIME_FORMAT).map_err(de::Error::custom)
}
