//! Prompt wording for each route. Every builder returns `(system, prompt)`.

const PAGE_EXCERPT_CHARS: usize = 4000;
const DOCUMENT_EXCERPT_CHARS: usize = 6000;
const REPORT_EXCERPT_CHARS: usize = 12000;

fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Debug, Clone)]
pub struct PromptTemplates {
    bot_name: String,
    persona: Option<String>,
}

impl PromptTemplates {
    pub fn new(bot_name: impl Into<String>, persona: Option<String>) -> Self {
        Self {
            bot_name: bot_name.into(),
            persona: persona.filter(|p| !p.trim().is_empty()),
        }
    }

    fn system(&self, role: &str) -> String {
        let preamble = match &self.persona {
            Some(persona) => persona.trim().to_string(),
            None => format!("You are {}, a concise technical assistant.", self.bot_name),
        };
        if role.is_empty() {
            preamble
        } else {
            format!("{}\n\n{}", preamble, role)
        }
    }

    pub fn analysis(&self, url: &str, page_excerpt: &str, request: &str) -> (String, String) {
        let system = self.system(
            "You read raw HTML and explain how a site is put together. \
             When client code helps, answer with a Python example using the requests module \
             inside a ```python block.",
        );
        let prompt = format!(
            "Target URL: {url}\n\n\
             Fetched HTML (truncated):\n{excerpt}\n\n\
             User request: {request}\n\n\
             Describe the page structure, forms and their fields, and any endpoints \
             the markup or scripts reference. Then address the user request directly.",
            url = url,
            excerpt = clip(page_excerpt, PAGE_EXCERPT_CHARS),
            request = request.trim(),
        );
        (system, prompt)
    }

    pub fn general(&self, request: &str, knowledge: &str) -> (String, String) {
        let mut prompt = format!("User: {}\n", request.trim());
        if !knowledge.trim().is_empty() {
            prompt.push_str("\nReference material:\n");
            prompt.push_str(knowledge);
            prompt.push('\n');
        }
        prompt.push_str("\nRespond helpfully and concisely. Provide working code if applicable.");
        (self.system(""), prompt)
    }

    pub fn document(&self, file_name: &str, request: &str, content: &str) -> (String, String) {
        let request = if request.trim().is_empty() {
            "Summarize this file and point out anything that looks broken."
        } else {
            request.trim()
        };
        let prompt = format!(
            "File: {}\n\nContent:\n{}\n\nRequest: {}",
            file_name,
            clip(content, DOCUMENT_EXCERPT_CHARS),
            request
        );
        (self.system("You review source and text files."), prompt)
    }

    pub fn capture_summary(&self, url: &str, report: &str) -> (String, String) {
        let system = self.system(
            "You explain the API traffic a web page produces. \
             Stick to what the captured requests show.",
        );
        let prompt = format!(
            "Captured network traffic for {}:\n\n{}\n\n\
             Summarize the flow: which endpoints are called, in what order, \
             what each one appears to do, and what the request bodies carry.",
            url,
            clip(report, REPORT_EXCERPT_CHARS)
        );
        (system, prompt)
    }

    pub fn welcome(&self) -> String {
        format!(
            "*{name}*\n\
             _Local model assistant_\n\n\
             Just write to me. I can:\n\
             • analyze a website: send a URL\n\
             • capture a page's API traffic: `/capture <url>`\n\
             • learn from your files: upload .py .txt .md .json .js\n\
             • answer general coding questions\n\n\
             Send /help for the command list.",
            name = self.bot_name
        )
    }

    pub fn help(&self) -> String {
        "*Commands*\n\
         /start - welcome message\n\
         /help - this list\n\
         /analyze <url> - fetch a page and explain it\n\
         /capture <url> - record the page's network traffic and summarize it\n\
         /cache - cache statistics (/cache clear to empty it)\n\
         /kb - list knowledge-base files\n\
         /stats - usage statistics\n\
         /history - recent captures"
            .to_string()
    }

    pub fn introduction(&self, model: &str) -> String {
        format!(
            "I'm *{name}*, an assistant running on a local model ({model}).\n\n\
             I fetch and explain web pages, record the API calls a page makes in a \
             headless browser, and answer questions using the files you upload as \
             reference material.",
            name = self.bot_name,
            model = model
        )
    }
}
