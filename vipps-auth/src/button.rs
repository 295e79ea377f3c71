//! "Log in with Vipps" buttons.
//!
//! [`ButtonOptions`] is a plain value; [`render`] turns it into the anchor markup the
//! site embeds in its templates.

use crate::redirect::encode_return_param;
use crate::settings::Flow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonKind {
    #[default]
    Login,
    Continue,
    /// Login flow with "register with" artwork.
    Register,
}

impl ButtonKind {
    fn image_prefix(&self) -> &'static str {
        match self {
            ButtonKind::Login => "log_in_with",
            ButtonKind::Continue => "continue_with",
            ButtonKind::Register => "register_with",
        }
    }

    pub fn flow(&self) -> Flow {
        match self {
            ButtonKind::Login | ButtonKind::Register => Flow::Login,
            ButtonKind::Continue => Flow::Continue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonSize {
    Small,
    #[default]
    Large,
}

impl ButtonSize {
    /// Image width in pixels.
    pub fn width(&self) -> u16 {
        match self {
            ButtonSize::Small => 210,
            ButtonSize::Large => 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonShape {
    Pill,
    #[default]
    Rect,
}

impl ButtonShape {
    fn as_str(&self) -> &'static str {
        match self {
            ButtonShape::Pill => "pill",
            ButtonShape::Rect => "rect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonLanguage {
    En,
    No,
}

impl ButtonLanguage {
    fn as_str(&self) -> &'static str {
        match self {
            ButtonLanguage::En => "EN",
            ButtonLanguage::No => "NO",
        }
    }

    /// Norwegian for Bokmål and Nynorsk sites, English otherwise.
    pub fn for_site_language(site_language: &str) -> Self {
        match site_language {
            "nb" | "nn" | "nb-NO" | "nn-NO" => ButtonLanguage::No,
            _ => ButtonLanguage::En,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ButtonOptions {
    pub kind: ButtonKind,
    pub size: ButtonSize,
    pub shape: ButtonShape,
    /// Falls back to the site language when unset.
    pub language: Option<ButtonLanguage>,
    pub return_url: Option<String>,
}

impl ButtonOptions {
    pub fn login() -> Self {
        Self::default()
    }

    pub fn continue_with() -> Self {
        Self {
            kind: ButtonKind::Continue,
            ..Self::default()
        }
    }

    pub fn register() -> Self {
        Self {
            kind: ButtonKind::Register,
            ..Self::default()
        }
    }

    pub fn small(self) -> Self {
        Self {
            size: ButtonSize::Small,
            ..self
        }
    }

    pub fn large(self) -> Self {
        Self {
            size: ButtonSize::Large,
            ..self
        }
    }

    pub fn pill(self) -> Self {
        Self {
            shape: ButtonShape::Pill,
            ..self
        }
    }

    pub fn rect(self) -> Self {
        Self {
            shape: ButtonShape::Rect,
            ..self
        }
    }

    pub fn language(self, language: ButtonLanguage) -> Self {
        Self {
            language: Some(language),
            ..self
        }
    }

    pub fn return_url(self, return_url: &str) -> Self {
        Self {
            return_url: Some(return_url.to_string()),
            ..self
        }
    }

    /// Image file name below `/vipps/asset/button/`.
    pub fn image_name(&self, site_language: &str) -> String {
        let language = self
            .language
            .unwrap_or_else(|| ButtonLanguage::for_site_language(site_language));
        format!(
            "{}_vipps_{}_{}_{}.svg",
            self.kind.image_prefix(),
            self.shape.as_str(),
            self.size.width(),
            language.as_str()
        )
    }
}

/// Site information needed to render a button.
#[derive(Debug, Clone)]
pub struct ButtonContext<'a> {
    pub site_url: &'a str,
    pub site_language: &'a str,
}

/// Render the button as an anchor wrapping the button image.
///
/// `anchor_attrs` and `img_attrs` are inserted verbatim into the respective tags.
pub fn render(
    options: &ButtonOptions,
    context: &ButtonContext<'_>,
    anchor_attrs: Option<&str>,
    img_attrs: Option<&str>,
) -> String {
    let mut href = format!(
        "{}{}",
        context.site_url.trim_end_matches('/'),
        options.kind.flow().start_path()
    );
    if let Some(return_url) = &options.return_url {
        href.push_str("?r=");
        href.push_str(&encode_return_param(return_url));
    }

    let anchor_attrs = anchor_attrs.map(|a| format!(" {}", a)).unwrap_or_default();
    let img_attrs = img_attrs.map(|a| format!(" {}", a)).unwrap_or_default();

    format!(
        "<a href=\"{}\"{}><img src=\"/vipps/asset/button/{}\"{}></a>",
        href,
        anchor_attrs,
        options.image_name(context.site_language),
        img_attrs
    )
}
