//! CSV link parser: raw links to labels, edges and a term-document matrix.
//!
//! Input records are `source,target,text` (RFC 4180 quoting; the text column
//! is optional). Each surviving link becomes one edge and one document.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;

use linkage_core::{
    defaults, Edge, Error, GraphParser, ImportOptions, ParsedGraph, RawLink, RawLinks, Result,
    TermDocumentMatrix,
};

const TOKEN_PATTERN: &str = r"\w+";

/// Split CSV text into records of fields.
pub fn parse_csv_records(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1usize;
    let mut quote_line = 0usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                line += 1;
                record.push(std::mem::take(&mut field));
                if record.iter().any(|f| !f.trim().is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(Error::Parse(format!(
            "unterminated quoted field starting on line {quote_line}"
        )));
    }
    record.push(field);
    if record.iter().any(|f| !f.trim().is_empty()) {
        records.push(record);
    }
    Ok(records)
}

fn links_from_records(records: Vec<Vec<String>>) -> Result<Vec<RawLink>> {
    let mut links = Vec::with_capacity(records.len());
    for (i, mut record) in records.into_iter().enumerate() {
        if i == 0
            && record.len() >= 2
            && record[0].trim().eq_ignore_ascii_case("source")
            && record[1].trim().eq_ignore_ascii_case("target")
        {
            continue;
        }
        if record.len() < 2 {
            return Err(Error::Parse(format!(
                "record {} has {} field(s), expected source,target[,text]",
                i + 1,
                record.len()
            )));
        }
        let text = if record.len() > 2 {
            record.split_off(2).join(",")
        } else {
            String::new()
        };
        links.push(RawLink {
            source: record[0].trim().to_string(),
            target: record[1].trim().to_string(),
            text,
        });
    }
    Ok(links)
}

/// Union-find over label ids.
struct Components {
    parent: Vec<usize>,
}

impl Components {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller id becomes the root so ties resolve deterministically.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

/// Concrete [`GraphParser`] for link lists and CSV uploads.
pub struct CsvLinkParser {
    token: Regex,
    min_term_len: usize,
}

impl CsvLinkParser {
    pub fn new() -> Result<Self> {
        let token = Regex::new(TOKEN_PATTERN)
            .map_err(|e| Error::Internal(format!("invalid token pattern: {e}")))?;
        Ok(Self {
            token,
            min_term_len: defaults::MIN_TERM_LEN,
        })
    }

    /// Minimum token length (in characters) kept as a term.
    pub fn with_min_term_len(mut self, min_term_len: usize) -> Self {
        self.min_term_len = min_term_len;
        self
    }

    fn tokenize<'a>(&'a self, text: &'a str) -> impl Iterator<Item = String> + 'a {
        self.token
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .filter(move |t| t.chars().count() >= self.min_term_len)
            .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
    }
}

impl GraphParser for CsvLinkParser {
    fn parse(&self, links: &RawLinks, options: &ImportOptions, directed: bool) -> Result<ParsedGraph> {
        let links = match links {
            RawLinks::Links(links) => links.clone(),
            RawLinks::Csv(text) => links_from_records(parse_csv_records(text)?)?,
        };

        // Label ids in first-seen order.
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut names: Vec<String> = Vec::new();
        let mut pairs: Vec<(usize, usize, String)> = Vec::new();
        for link in links {
            let (source, target) = (link.source.trim(), link.target.trim());
            if source.is_empty() || target.is_empty() {
                continue;
            }
            if options.ignore_self_loop && source == target {
                continue;
            }
            let mut id_of = |name: &str| -> usize {
                if let Some(&id) = index.get(name) {
                    return id;
                }
                names.push(name.to_string());
                index.insert(name.to_string(), names.len() - 1);
                names.len() - 1
            };
            let (mut s, mut t) = (id_of(source), id_of(target));
            if !directed && s > t {
                std::mem::swap(&mut s, &mut t);
            }
            pairs.push((s, t, link.text));
        }

        let keep: Vec<bool> = if options.filter_largest_subgraph && !names.is_empty() {
            let mut components = Components::new(names.len());
            for (s, t, _) in &pairs {
                components.union(*s, *t);
            }
            let mut sizes: BTreeMap<usize, usize> = BTreeMap::new();
            for id in 0..names.len() {
                *sizes.entry(components.find(id)).or_default() += 1;
            }
            // Largest component; ties go to the one with the smallest root id.
            let largest = sizes
                .iter()
                .fold((usize::MAX, 0usize), |best, (&root, &size)| {
                    if size > best.1 {
                        (root, size)
                    } else {
                        best
                    }
                })
                .0;
            (0..names.len()).map(|id| components.find(id) == largest).collect()
        } else {
            vec![true; names.len()]
        };

        // Re-index kept labels densely.
        let mut remap: Vec<Option<u32>> = vec![None; names.len()];
        let mut labels = Vec::new();
        for (id, name) in names.into_iter().enumerate() {
            if keep[id] {
                remap[id] = Some(labels.len() as u32);
                labels.push(name);
            }
        }

        let mut edges = Vec::new();
        let mut term_index: HashMap<String, u32> = HashMap::new();
        let mut terms: Vec<String> = Vec::new();
        let mut entries = Vec::new();
        for (s, t, text) in pairs {
            let (Some(source), Some(target)) = (remap[s], remap[t]) else {
                continue;
            };
            let document = edges.len() as u32;
            edges.push(Edge {
                source,
                target,
                document,
            });

            let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
            for token in self.tokenize(&text) {
                let term = match term_index.get(&token) {
                    Some(&term) => term,
                    None => {
                        let term = terms.len() as u32;
                        term_index.insert(token.clone(), term);
                        terms.push(token);
                        term
                    }
                };
                *counts.entry(term).or_default() += 1;
            }
            entries.extend(counts.into_iter().map(|(term, count)| (document, term, count)));
        }

        Ok(ParsedGraph {
            labels,
            matrix: TermDocumentMatrix {
                terms,
                documents: edges.len() as u32,
                entries,
            },
            edges,
        })
    }
}
