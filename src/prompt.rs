//! Prompt package assembly
//!
//! A prompt package is a markdown document that pairs a full-page screenshot
//! with the page's truncated HTML and a judging prompt, ready to hand to a
//! downstream model.

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;

pub const DEFAULT_PROMPT_TEMPLATE: &str = r#"Dark pattern list with definition:
Dark Pattern Type: Disguised ad; Definition: Presents advertisements as legitimate interface elements, making it more likely that users will click on them;
Dark Pattern Type: False hierarchy; Definition: Manipulates the visual prominence or layout order of interface elements to mislead users about their importance or recommended choice;
Dark Pattern Type: Preselection; Definition: Makes certain options that benefit the platform automatically checked, toggled on, or selected by default without user's explicit consent;
Dark Pattern Type: Pop-up ad; Definition: Makes certain options that benefit the platform automatically checked, toggled on, or selected by default without user's explicit consent;
Dark Pattern Type: Trick wording; Definition: Uses confusing, tricky wording, such as double negative language, to manipulate users into taking actions they did not intend;
Dark Pattern Type: Confirm shaming; Definition: Uses emotionally manipulative or guilt-inducing language to pressure users into making a particular choice, typically one that benefits the platform;
Dark Pattern Type: Fake social proof; Definition: Creates a false impression of popularity, trust, or credibility by displaying fabricated or misleading social signals, such as fake reviews or testimonials;
Dark Pattern Type: Forced Action; Definition: Compels users to perform an unwanted or unrelated action, such as creating an account, downloading an app, as a prerequisite for completing their desired task;
Dark Pattern Type: Hidden information; Definition: Conceals or obscures important options, costs, or information that are relevant to the user's decision-making process;

Assume you are a judger for dark pattern, identify the top 3 most obvious dark pattern in the home page, using the screenshot of the page. Use the truncated HTML below as a secondary support to help you identify the dark patterns. Using the terminology in the dark pattern list.

Page URL: {{URL}}
Page Title: {{TITLE}}
Captured At: {{TIME}}
Screenshot File: {{SCREENSHOT_FILENAME}}

Truncated HTML:
{{TRUNCATED_HTML}}
"#;

/// Values substituted into a prompt template
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub url: String,
    pub title: String,
    pub time: String,
    pub screenshot_filename: String,
    pub truncated_html: String,
}

/// Replace every placeholder in `template`, in a fixed order.
pub fn fill_template(template: &str, vars: &TemplateVars) -> String {
    template
        .replace("{{URL}}", &vars.url)
        .replace("{{TITLE}}", &vars.title)
        .replace("{{TIME}}", &vars.time)
        .replace("{{SCREENSHOT_FILENAME}}", &vars.screenshot_filename)
        .replace("{{TRUNCATED_HTML}}", &vars.truncated_html)
}

pub fn wrap_html(html: &str) -> String {
    format!("\n```html\n{html}\n```\n")
}

/// Everything needed to render one prompt package
#[derive(Debug, Clone)]
pub struct PromptPackage {
    pub url: String,
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub screenshot_filename: String,
    pub truncated_html: String,
}

impl PromptPackage {
    pub fn time(&self) -> String {
        iso_timestamp(&self.generated_at)
    }

    /// Markdown header followed by the filled template.
    pub fn to_markdown(&self, template: &str) -> String {
        let time = self.time();
        let filled = fill_template(
            template,
            &TemplateVars {
                url: self.url.clone(),
                title: self.title.clone(),
                time: time.clone(),
                screenshot_filename: self.screenshot_filename.clone(),
                truncated_html: wrap_html(&self.truncated_html),
            },
        );

        format!(
            "# Dark Pattern Prompt Package\n\n\
             - URL: {}\n\
             - Title: {}\n\
             - Time: {}\n\
             - Screenshot: {}\n\n\
             ---\n\n\
             {}\n",
            self.url, self.title, time, self.screenshot_filename, filled
        )
    }
}

pub fn iso_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `darkpattern_<host>_<stamp>`, safe for use as a file name stem.
pub fn package_base_name(url: &str, time: &DateTime<Utc>) -> String {
    let domain = crate::extract_domain(url).unwrap_or_else(|| "page".to_string());
    let stamp = iso_timestamp(time).replace([':', '.'], "-");
    crate::sanitize_filename(&format!("darkpattern_{domain}_{stamp}"))
}

/// Read a template override, or fall back to the built-in template.
pub async fn load_template(path: Option<&Path>) -> Result<String, crate::CaptureError> {
    match path {
        Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
            crate::CaptureError::Configuration(format!(
                "cannot read template {}: {e}",
                path.display()
            ))
        }),
        None => Ok(DEFAULT_PROMPT_TEMPLATE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
    }

    #[test]
    fn test_fill_template_replaces_all_occurrences() {
        let vars = TemplateVars {
            url: "https://shop.test/".to_string(),
            title: "Shop".to_string(),
            ..Default::default()
        };
        let filled = fill_template("{{URL}} {{TITLE}} {{URL}} [{{TIME}}]", &vars);
        assert_eq!(filled, "https://shop.test/ Shop https://shop.test/ []");
    }

    #[test]
    fn test_default_template_has_every_placeholder() {
        for placeholder in [
            "{{URL}}",
            "{{TITLE}}",
            "{{TIME}}",
            "{{SCREENSHOT_FILENAME}}",
            "{{TRUNCATED_HTML}}",
        ] {
            assert!(DEFAULT_PROMPT_TEMPLATE.contains(placeholder), "{placeholder}");
        }
    }

    #[test]
    fn test_markdown_layout() {
        let package = PromptPackage {
            url: "https://shop.test/".to_string(),
            title: "Shop".to_string(),
            generated_at: fixed_time(),
            screenshot_filename: "shot.png".to_string(),
            truncated_html: "<p>hi</p>".to_string(),
        };
        let md = package.to_markdown("HTML:{{TRUNCATED_HTML}}");

        assert!(md.starts_with(
            "# Dark Pattern Prompt Package\n\n- URL: https://shop.test/\n- Title: Shop\n\
             - Time: 2024-03-05T14:07:09.000Z\n- Screenshot: shot.png\n\n---\n\n"
        ));
        assert!(md.ends_with("HTML:\n```html\n<p>hi</p>\n```\n\n"));
    }

    #[test]
    fn test_package_base_name() {
        assert_eq!(
            package_base_name("https://shop.test/cart", &fixed_time()),
            "darkpattern_shop.test_2024-03-05T14-07-09-000Z"
        );
        assert_eq!(
            package_base_name("not a url", &fixed_time()),
            "darkpattern_page_2024-03-05T14-07-09-000Z"
        );
    }

    #[tokio::test]
    async fn test_load_template_default() {
        let template = load_template(None).await.unwrap();
        assert_eq!(template, DEFAULT_PROMPT_TEMPLATE);
    }
}
