//! # Lettermill Mailer
//!
//! Rendering and delivery: `{{key}}` / `{{key ?? default}}` template
//! substitution (arrays become unordered HTML lists), sender resolution,
//! the marketing unsubscribe footer, and the lettre SMTP dispatcher behind
//! the `EmailDispatcher` trait.
//!
//! Rendering is deliberately late: deferred sends substitute variables at
//! scheduler time so contact metadata is as fresh as possible.

pub mod smtp;
pub mod template;

pub use smtp::SmtpMailer;
pub use template::{contact_vars, render, render_email, resolve_sender};
