mod campaign_name;
mod chunk_meta;
mod subscriber_email;
mod template_title;
// allow external `use` statements to skip `subscriber_email` etc
pub use campaign_name::CampaignName;
pub use chunk_meta::ChunkMeta;
pub use subscriber_email::SubscriberEmail;
pub use template_title::TemplateTitle;
