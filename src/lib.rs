//! Self-extracting launcher.
//!
//! The launcher's own file carries a bundle after its ELF image. At start it
//! extracts the bundle into a fresh temp directory and runs the main
//! executable from there. After the app exits, the extracted tree is either
//! handed to an external packer (self-repackable bundles whose files
//! changed) or deleted.

pub mod bundle;
pub mod changes;
pub mod error;
pub mod extract;
pub mod image;
pub mod repack;
pub mod scan;
pub mod session;
pub mod signals;
pub mod trampoline;

pub use bundle::{Bundle, BundleReader, FileEntry, Header, RepackKit};
pub use error::{Error, Result};
pub use session::{launch, Disposition, Phase, Session};
pub use signals::Interrupts;
