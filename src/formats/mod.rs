//! Per-vendor readers.  Each composes the catalog, record and assembly
//! layers for one file format; [`crate::container`] picks the reader.
//!
//! | Module | Extension | Catalog |
//! |---|---|---|
//! | [`heidelberg`] | `.e2e` | linked directory |
//! | [`topcon`] | `.fda`, `.fds` | tagged chunks |
//! | [`bioptigen`] | `.OCT` | frame stack |
//! | [`optovue`] | `.oct` + `.txt` sidecar | raw stream |
//! | [`zeiss`] | `.img` | raw stream |

pub mod bioptigen;
pub mod heidelberg;
pub mod optovue;
pub mod topcon;
pub mod zeiss;
