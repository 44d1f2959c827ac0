//! Offline contract-type heuristic.
//!
//! Three lexical signals are computed per category and blended:
//!
//! | Signal     | Weight | Source                                              |
//! |------------|--------|-----------------------------------------------------|
//! | title      | 0.4    | category aliases in the first ~500 characters       |
//! | keywords   | 0.5    | weighted discriminant terms, normalised by the best |
//! | structure  | 0.1    | fraction of clause-header patterns present          |
//!
//! An exact alias hit in the title window short-circuits at 0.95. The
//! blended scores are renormalised to sum to 1 and the argmax wins.

use super::{ContractType, DetectionResult, DetectionSource};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// Characters scanned for title aliases.
const TITLE_WINDOW_CHARS: usize = 500;
/// Characters scanned for keywords and structure.
const SCAN_WINDOW_CHARS: usize = 60_000;
/// Occurrences of one term counted at most this many times.
const MAX_OCCURRENCES: usize = 5;
const MAX_EVIDENCE: usize = 5;
const EVIDENCE_RADIUS: usize = 40;

/// Confidence reported for an exact title alias hit.
pub const TITLE_HIT_CONFIDENCE: f64 = 0.95;

// ── Tables ───────────────────────────────────────────────────────────────

const TITLE_ALIASES: &[(ContractType, &[&str])] = &[
    (
        ContractType::TermsOfService,
        &[
            "conditions générales d'utilisation",
            "conditions générales de vente",
            "conditions générales",
            "terms of service",
            "terms and conditions",
            "terms of use",
            "cgu",
            "cgv",
        ],
    ),
    (
        ContractType::Freelance,
        &[
            "contrat de prestation de services",
            "contrat de prestation",
            "contrat de mission freelance",
            "contrat freelance",
            "freelance agreement",
            "independent contractor agreement",
            "consulting agreement",
            "services agreement",
        ],
    ),
    (
        ContractType::Employment,
        &[
            "contrat de travail",
            "contrat à durée indéterminée",
            "contrat à durée déterminée",
            "promesse d'embauche",
            "employment agreement",
            "employment contract",
            "offer of employment",
        ],
    ),
    (
        ContractType::Nda,
        &[
            "accord de confidentialité",
            "engagement de confidentialité",
            "contrat de confidentialité",
            "non-disclosure agreement",
            "confidentiality agreement",
            "nda",
        ],
    ),
    (
        ContractType::Quote,
        &["devis", "proposition commerciale", "quotation", "price quote", "estimate"],
    ),
    (
        ContractType::Partnership,
        &[
            "contrat de partenariat",
            "accord de partenariat",
            "pacte d'associés",
            "partnership agreement",
            "joint venture agreement",
            "shareholders agreement",
        ],
    ),
    (
        ContractType::AdministrativeForm,
        &["cerfa", "formulaire", "application form", "registration form"],
    ),
    (
        ContractType::TabularCommercial,
        &[
            "bon de commande",
            "grille tarifaire",
            "liste de prix",
            "bordereau de prix",
            "price list",
            "purchase order",
            "rate card",
        ],
    ),
];

const KEYWORDS: &[(ContractType, &[(&str, f64)])] = &[
    (
        ContractType::TermsOfService,
        &[
            ("utilisateur", 2.0),
            ("user", 1.5),
            ("plateforme", 2.0),
            ("platform", 1.5),
            ("compte utilisateur", 2.5),
            ("account", 1.0),
            ("données personnelles", 1.5),
            ("personal data", 1.5),
            ("site internet", 1.5),
            ("website", 1.5),
            ("acceptation des conditions", 3.0),
            ("service", 0.5),
        ],
    ),
    (
        ContractType::Freelance,
        &[
            ("prestataire", 3.0),
            ("contractor", 3.0),
            ("freelance", 3.0),
            ("mission", 1.5),
            ("livrables", 2.0),
            ("deliverables", 2.0),
            ("taux journalier", 3.0),
            ("daily rate", 3.0),
            ("tjm", 3.0),
            ("statement of work", 2.5),
            ("propriété intellectuelle", 1.0),
            ("intellectual property", 1.0),
        ],
    ),
    (
        ContractType::Employment,
        &[
            ("salarié", 3.0),
            ("employé", 2.0),
            ("employee", 3.0),
            ("employeur", 3.0),
            ("employer", 3.0),
            ("période d'essai", 3.0),
            ("probation period", 3.0),
            ("rémunération brute", 2.5),
            ("salaire", 2.0),
            ("salary", 2.0),
            ("convention collective", 3.0),
            ("congés payés", 2.5),
        ],
    ),
    (
        ContractType::Nda,
        &[
            ("confidentialité", 2.0),
            ("confidential", 2.0),
            ("informations confidentielles", 3.0),
            ("confidential information", 3.0),
            ("divulgation", 2.5),
            ("disclosure", 2.5),
            ("partie divulgatrice", 3.0),
            ("disclosing party", 3.0),
            ("partie réceptrice", 3.0),
            ("receiving party", 3.0),
        ],
    ),
    (
        ContractType::Quote,
        &[
            ("devis", 3.0),
            ("quote", 2.0),
            ("validité de l'offre", 3.0),
            ("valid for", 1.5),
            ("montant ht", 2.5),
            ("total ttc", 2.5),
            ("tva", 1.0),
            ("bon pour accord", 3.0),
            ("acompte", 1.5),
            ("deposit", 1.0),
        ],
    ),
    (
        ContractType::Partnership,
        &[
            ("partenaire", 2.5),
            ("partner", 2.5),
            ("partenariat", 3.0),
            ("partnership", 3.0),
            ("associé", 2.0),
            ("co-marketing", 2.5),
            ("partage des revenus", 3.0),
            ("revenue share", 3.0),
            ("joint venture", 3.0),
        ],
    ),
    (
        ContractType::AdministrativeForm,
        &[
            ("cerfa", 3.0),
            ("formulaire", 2.5),
            ("cochez", 2.5),
            ("tick the box", 2.5),
            ("cadre réservé", 3.0),
            ("demandeur", 2.0),
            ("applicant", 2.0),
            ("date de naissance", 2.0),
            ("date of birth", 2.0),
            ("nom de naissance", 2.5),
        ],
    ),
    (
        ContractType::TabularCommercial,
        &[
            ("prix unitaire", 3.0),
            ("unit price", 3.0),
            ("quantité", 2.0),
            ("quantity", 2.0),
            ("référence", 1.0),
            ("sku", 2.5),
            ("remise", 1.5),
            ("discount", 1.5),
            ("tarif", 2.0),
            ("total ht", 1.5),
        ],
    ),
];

const STRUCTURE: &[(ContractType, &[&str])] = &[
    (
        ContractType::TermsOfService,
        &[
            r"(?i)article\s+\d+\s*[:.\-]?\s*(?:objet|acceptation)",
            r"(?i)(?:création|inscription).{0,20}compte",
            r"(?i)(?:modification|évolution)s?\s+des\s+(?:cgu|conditions)",
            r"(?i)(?:responsabilité|liability).{0,40}(?:site|plateforme|platform|service)",
        ],
    ),
    (
        ContractType::Freelance,
        &[
            r"(?i)(?:article\s+\d+\s*[:.\-]?\s*)?(?:description|objet)\s+de\s+la\s+mission",
            r"(?i)(?:modalités|conditions)\s+(?:de\s+)?(?:facturation|paiement)",
            r"(?i)(?:indépendance|independent contractor)",
            r"(?i)(?:cession|transfer)\s+(?:des\s+droits|of\s+rights)",
        ],
    ),
    (
        ContractType::Employment,
        &[
            r"(?i)(?:article\s+\d+\s*[:.\-]?\s*)?p[ée]riode\s+d'essai",
            r"(?i)(?:durée|horaires?)\s+du\s+travail",
            r"(?i)(?:clause\s+de\s+)?non[- ]concurrence",
            r"(?i)(?:rémunération|remuneration|salary)\s*[:.\-]",
        ],
    ),
    (
        ContractType::Nda,
        &[
            r"(?i)article\s+\d+\s*[:.\-]?\s*confidentialit",
            r"(?i)d[ée]finition\s+des\s+informations\s+confidentielles",
            r"(?i)definition\s+of\s+confidential\s+information",
            r"(?i)(?:durée|duration|term)\s+(?:de\s+l'obligation\s+)?(?:de\s+confidentialité|of\s+confidentiality)",
        ],
    ),
    (
        ContractType::Quote,
        &[
            r"(?i)devis\s+n[°o]\s*\S+",
            r"(?i)(?:valable|valid)\s+(?:jusqu'au|\d+\s+jours|for\s+\d+\s+days)",
            r"(?i)total\s+(?:ht|ttc)\s*[:\s]\s*\d",
            r"(?i)bon\s+pour\s+accord",
        ],
    ),
    (
        ContractType::Partnership,
        &[
            r"(?i)(?:article\s+\d+\s*[:.\-]?\s*)?(?:objet|purpose)\s+du\s+partenariat",
            r"(?i)(?:engagements|obligations)\s+(?:des|of\s+the)\s+(?:partenaires|partners)",
            r"(?i)(?:partage|répartition)\s+des\s+(?:revenus|bénéfices|coûts)",
            r"(?i)gouvernance|comité\s+de\s+pilotage|steering\s+committee",
        ],
    ),
    (
        ContractType::AdministrativeForm,
        &[
            r"(?i)cerfa\s*n[°o]?\s*\d+",
            r"(?i)cadre\s+r[ée]serv[ée]\s+à\s+l'administration",
            r"(?i)(?:je\s+soussign[ée]|i,\s+the\s+undersigned)",
            r"[☐☑☒□]",
        ],
    ),
    (
        ContractType::TabularCommercial,
        &[
            r"(?i)d[ée]signation\s+.{0,20}quantit[ée]",
            r"(?i)prix\s+unitaire|unit\s+price",
            r"(?i)(?:réf\.?|sku)\s*[:#]?\s*[A-Z0-9\-]{3,}",
            r"(?m)^(?:\S+\s+){2,}\d+(?:[.,]\d{2})?\s*(?:€|eur|\$)\s*$",
        ],
    ),
];

// ── Compiled tables ──────────────────────────────────────────────────────

fn word_regex(term: &str) -> Regex {
    // Lazy statics below only compile literal terms, so this cannot fail.
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))).unwrap()
}

static ALIAS_RES: Lazy<Vec<(ContractType, &'static str, Regex)>> = Lazy::new(|| {
    TITLE_ALIASES
        .iter()
        .flat_map(|(t, aliases)| aliases.iter().map(move |a| (*t, *a, word_regex(a))))
        .collect()
});

static KEYWORD_RES: Lazy<Vec<(ContractType, &'static str, f64, Regex)>> = Lazy::new(|| {
    KEYWORDS
        .iter()
        .flat_map(|(t, terms)| terms.iter().map(move |(k, w)| (*t, *k, *w, word_regex(k))))
        .collect()
});

static STRUCTURE_RES: Lazy<Vec<(ContractType, Vec<Regex>)>> = Lazy::new(|| {
    STRUCTURE
        .iter()
        .map(|(t, patterns)| (*t, patterns.iter().map(|p| Regex::new(p).unwrap()).collect()))
        .collect()
});

// ── Signals ──────────────────────────────────────────────────────────────

fn prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Longest alias found verbatim in the title window.
fn exact_title_hit(window: &str) -> Option<(ContractType, &'static str)> {
    ALIAS_RES
        .iter()
        .filter(|(_, _, re)| re.is_match(window))
        .max_by_key(|(_, alias, _)| alias.chars().count())
        .map(|(t, alias, _)| (*t, *alias))
}

/// Partial title score per category: the best fraction of an alias's
/// significant words present in the window, kept when at least one half.
fn title_scores(window: &str) -> HashMap<ContractType, f64> {
    let lower = window.to_lowercase();
    let mut scores = HashMap::new();
    for (t, aliases) in TITLE_ALIASES {
        let best = aliases
            .iter()
            .filter_map(|alias| {
                let words: Vec<&str> = alias
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| w.chars().count() > 3)
                    .collect();
                if words.is_empty() {
                    return None;
                }
                let found = words.iter().filter(|w| lower.contains(**w)).count();
                Some(found as f64 / words.len() as f64)
            })
            .fold(0.0, f64::max);
        if best >= 0.5 {
            scores.insert(*t, best);
        }
    }
    scores
}

struct KeywordHit {
    contract_type: ContractType,
    weight: f64,
    start: usize,
    end: usize,
}

/// Raw keyword scores per category plus every counted hit.
fn keyword_scores(text: &str) -> (HashMap<ContractType, f64>, Vec<KeywordHit>) {
    let mut scores: HashMap<ContractType, f64> = HashMap::new();
    let mut hits = Vec::new();
    for (t, _, weight, re) in KEYWORD_RES.iter() {
        let matches: Vec<_> = re.find_iter(text).take(MAX_OCCURRENCES).collect();
        if matches.is_empty() {
            continue;
        }
        *scores.entry(*t).or_default() += matches.len() as f64 * weight;
        hits.extend(matches.iter().map(|m| KeywordHit {
            contract_type: *t,
            weight: *weight,
            start: m.start(),
            end: m.end(),
        }));
    }
    (scores, hits)
}

fn structure_scores(text: &str) -> HashMap<ContractType, f64> {
    STRUCTURE_RES
        .iter()
        .map(|(t, patterns)| {
            let matched = patterns.iter().filter(|re| re.is_match(text)).count();
            (*t, matched as f64 / patterns.len().max(1) as f64)
        })
        .collect()
}

fn excerpt_around(text: &str, start: usize, end: usize) -> String {
    let mut from = start.saturating_sub(EVIDENCE_RADIUS);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + EVIDENCE_RADIUS).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }
    let snippet = text[from..to].split_whitespace().collect::<Vec<_>>().join(" ");
    format!("…{snippet}…")
}

fn evidence_for(text: &str, winner: ContractType, hits: &[KeywordHit]) -> Vec<String> {
    let mut mine: Vec<&KeywordHit> = hits.iter().filter(|h| h.contract_type == winner).collect();
    mine.sort_by(|a, b| b.weight.total_cmp(&a.weight).then(a.start.cmp(&b.start)));
    let mut evidence: Vec<String> = Vec::new();
    for hit in mine {
        let excerpt = excerpt_around(text, hit.start, hit.end);
        if !evidence.contains(&excerpt) {
            evidence.push(excerpt);
        }
        if evidence.len() == MAX_EVIDENCE {
            break;
        }
    }
    evidence
}

// ── Entry points ─────────────────────────────────────────────────────────

/// Run the offline heuristic. Never fails; pure CPU.
pub fn detect(text: &str) -> DetectionResult {
    let window = prefix(text, TITLE_WINDOW_CHARS);
    if let Some((contract_type, alias)) = exact_title_hit(window) {
        debug!(contract_type = contract_type.as_str(), alias, "title alias hit");
        return DetectionResult {
            contract_type,
            confidence: TITLE_HIT_CONFIDENCE,
            source: DetectionSource::Heuristic,
            evidence: vec![format!("title matches \"{alias}\"")],
            reason: Some("document title names the category".into()),
        };
    }

    let scan = prefix(text, SCAN_WINDOW_CHARS);
    let titles = title_scores(window);
    let (keywords, hits) = keyword_scores(scan);
    let structure = structure_scores(scan);
    let max_keyword = keywords.values().copied().fold(0.0, f64::max);

    let mut combined: Vec<(ContractType, f64)> = ContractType::ALL
        .iter()
        .filter(|t| **t != ContractType::Other)
        .map(|t| {
            let title = titles.get(t).copied().unwrap_or(0.0);
            let keyword = if max_keyword > 0.0 {
                keywords.get(t).copied().unwrap_or(0.0) / max_keyword
            } else {
                0.0
            };
            let structural = structure.get(t).copied().unwrap_or(0.0);
            (*t, 0.4 * title + 0.5 * keyword + 0.1 * structural)
        })
        .collect();

    let total: f64 = combined.iter().map(|(_, s)| s).sum();
    if total <= 0.0 {
        return DetectionResult {
            contract_type: ContractType::Other,
            confidence: 0.0,
            source: DetectionSource::Heuristic,
            evidence: Vec::new(),
            reason: Some("no category signal found".into()),
        };
    }
    for (_, score) in combined.iter_mut() {
        *score /= total;
    }
    combined.sort_by(|a, b| b.1.total_cmp(&a.1));
    let (winner, confidence) = combined[0];
    debug!(
        contract_type = winner.as_str(),
        confidence,
        runner_up = combined.get(1).map(|(t, _)| t.as_str()),
        "heuristic scores"
    );

    DetectionResult {
        contract_type: winner,
        confidence,
        source: DetectionSource::Heuristic,
        evidence: evidence_for(scan, winner, &hits),
        reason: None,
    }
}

/// Up to `max` lines containing any category keyword, in document order.
pub fn keyword_lines(text: &str, max: usize) -> Vec<&str> {
    prefix(text, SCAN_WINDOW_CHARS)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && KEYWORD_RES.iter().any(|(_, _, _, re)| re.is_match(line)))
        .take(max)
        .collect()
}
