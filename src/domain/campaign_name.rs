use std::fmt::Display;

use unicode_segmentation::UnicodeSegmentation;

/// Name of a mailing list (campaign). Surrounding whitespace is removed; the
/// result must be non-empty, at most 256 graphemes, and free of `,` (the
/// separator of the compose form's `campaigns` field), `/` (names appear as
/// path segments) and control characters.
///
/// Must be instantiated with `CampaignName::parse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignName(String);

impl CampaignName {
    pub fn parse(name: String) -> Result<Self, String> {
        let name = name.trim();
        let empty = name.is_empty();
        let too_long = name.graphemes(true).count() > 256;
        let bad = name.chars().any(|c| c == ',' || c == '/' || c.is_control());
        match !empty && !too_long && !bad {
            true => Ok(Self(name.to_string())),
            false => Err(format!("Invalid campaign name: {name:?}")),
        }
    }
}

impl AsRef<str> for CampaignName {
    fn as_ref(&self) -> &str { &self.0 }
}

impl Display for CampaignName {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
