//! C10 — dynamic-rendering attachment layout, descriptor set layouts, and
//! the PBR/debug graphics pipelines built against them.

pub mod debug_pipelines;
pub mod descriptor;
pub mod pbr;
pub mod render_pass;

pub use debug_pipelines::{effective_mode, PipelineSet};
pub use descriptor::DescriptorLayouts;
pub use pbr::{PushConstants, Vertex};
pub use render_pass::AttachmentLayout;
