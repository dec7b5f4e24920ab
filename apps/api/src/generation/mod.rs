// CV generation: drafts a complete CV from the caller's profile and a job description.
// Goes through the shared dispatcher; never touches a chat session.

pub mod generator;
pub mod handlers;
pub mod prompts;
