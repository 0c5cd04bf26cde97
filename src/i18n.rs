//! Short user-facing messages. Upstream error payloads never reach clients;
//! handlers map failures to one of these keys instead.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    En,
    #[default]
    Sq,
}

impl Locale {
    pub fn parse(input: Option<&str>) -> Self {
        match input.map(|s| s.trim().to_lowercase()) {
            Some(code) if code.starts_with("en") => Locale::En,
            _ => Locale::Sq,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Locale::En => "en",
            Locale::Sq => "sq",
        }
    }
}

pub fn message(key: &str, locale: Locale) -> &'static str {
    match (key, locale) {
        ("invalid_vin", Locale::En) => "The VIN you entered is not valid.",
        ("invalid_vin", Locale::Sq) => "Numri VIN që keni futur nuk është i vlefshëm.",
        ("unavailable", Locale::En) => "The report service is busy. Please try again shortly.",
        ("unavailable", Locale::Sq) => "Shërbimi i raportit është i zënë. Provoni përsëri pak më vonë.",
        ("quota_exhausted", Locale::En) => "No reports can be ordered right now. Please try again later.",
        ("quota_exhausted", Locale::Sq) => "Nuk mund të porositen raporte tani. Provoni përsëri më vonë.",
        ("invalid_input", Locale::En) => "Some required fields are missing or invalid.",
        ("invalid_input", Locale::Sq) => "Disa fusha të detyrueshme mungojnë ose janë të pavlefshme.",
        ("not_found", Locale::En) => "Inspection not found.",
        ("not_found", Locale::Sq) => "Inspektimi nuk u gjet.",
        ("email_subject", Locale::En) => "Your vehicle report is ready",
        ("email_subject", Locale::Sq) => "Raporti i automjetit tuaj është gati",
        ("email_button", Locale::En) => "Open Full Report",
        ("email_button", Locale::Sq) => "Hap raportin e plotë",
        (_, Locale::En) => "Something went wrong. Please try again.",
        (_, Locale::Sq) => "Diçka shkoi keq. Ju lutem provoni përsëri.",
    }
}
