// Prompt constants for CV generation.

/// System prompt for CV drafting.
pub const GENERATION_SYSTEM: &str =
    "You are an IT-industry HR expert and a professional CV writer. \
    You receive the user's data (personal information, skills, experience, projects) \
    and/or a job description. Analyse how well the profile fits the job description, \
    suggest improvements, and produce a complete, compelling CV that follows IT-industry conventions.";

/// Worked example sent as the first user message, ahead of the real payload.
pub const FEW_SHOT_EXAMPLE: &str = "\
Example:
Input:
The user knows Python, Django and REST APIs, with 2 years of backend experience.
JD: Python Developer, requires Django, REST APIs and PostgreSQL.

Output:
Summary: Python developer with 2 years of experience building APIs.
Skills: Python, Django, REST API, PostgreSQL.
Experience: Optimised internal APIs, improving throughput by 30%.
=> Produce a similar complete CV from the data the user provides.";
