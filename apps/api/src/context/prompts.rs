// Fragments the context assembler uses to lay out profile and attachment context.

/// Characters of the profile JD shown in the system block before it is cut off.
pub const JD_EXCERPT_CHARS: usize = 200;

pub const PROFILE_HEADER: &str = "User information:";
pub const NAME_LABEL: &str = "Name";
pub const SKILLS_LABEL: &str = "Skills";
pub const EXPERIENCE_LABEL: &str = "Experience";
pub const PROJECTS_LABEL: &str = "Projects";
pub const JD_LABEL: &str = "Current JD";

/// Shown in place of document text the normalizer could not extract.
pub const UNREADABLE_DOCUMENT: &str = "The content of this document could not be read. \
Tell the user the file could not be read and suggest uploading it as plain text or an image.";

/// Shown in place of an image the normalizer could not decode.
pub const UNREADABLE_IMAGE: &str = "This image could not be read. \
Tell the user the image could not be read and suggest uploading it again as png or jpeg.";

/// Prefix of the note recorded in history for uploaded files.
pub const UPLOAD_NOTE_PREFIX: &str = "Uploaded:";
pub const UNREADABLE_MARK: &str = "(unreadable)";
