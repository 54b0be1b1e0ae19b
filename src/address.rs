//! Strict RFC821 envelope address parsing and command line tokenizing.

/// Characters that must be backslash-escaped inside an envelope address.
const SPECIAL: &str = "<>()[],\" ";
const QUOTE: char = '\\';

/// Reasons an envelope argument is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Bad command syntax")]
    BadCommandSyntax,
    #[error("Non 7bit")]
    Non7Bit,
    #[error("Unmatched address")]
    Unmatched,
    #[error("Bad option syntax")]
    BadOptionSyntax,
    #[error("Too many @")]
    TooManyAt,
    #[error("Bad quoted sequence")]
    BadQuotedSequence,
}

/// A parsed `MAIL FROM:` / `RCPT TO:` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeAddress {
    /// Unescaped address, empty for the null path `<>`.
    pub address: String,
    /// Parameters following the address, verbatim.
    pub options: Option<String>,
}

/// Splits a command line into its upper-cased verb and trimmed argument.
pub fn tokenize(line: &str) -> (String, Option<&str>) {
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), Some(arg.trim())),
        None => (line.to_ascii_uppercase(), None),
    }
}

/// Parses the argument of `MAIL` or `RCPT`; `keyword` is `FROM:` or `TO:`.
pub fn parse_envelope_address(keyword: &str, arg: &str) -> Result<EnvelopeAddress, AddressError> {
    let head = arg
        .get(..keyword.len())
        .ok_or(AddressError::BadCommandSyntax)?;
    if !head.eq_ignore_ascii_case(keyword) {
        return Err(AddressError::BadCommandSyntax);
    }
    let Some(rest) = arg.get(keyword.len()..) else {
        return Err(AddressError::BadCommandSyntax);
    };
    let rest = rest.trim();

    if !rest.is_ascii() {
        return Err(AddressError::Non7Bit);
    }

    let (address, options) = split_path(rest).ok_or(AddressError::Unmatched)?;

    if !options.is_empty() && !options.starts_with(' ') {
        return Err(AddressError::BadOptionSyntax);
    }
    let options = Some(options.trim())
        .filter(|o| !o.is_empty())
        .map(str::to_string);

    // <> null return path
    if address.len() < 3 {
        return Ok(EnvelopeAddress {
            address: String::new(),
            options,
        });
    }

    if address.matches('@').count() > 1 {
        return Err(AddressError::TooManyAt);
    }

    // 'user@example.com' from broken clients
    let address = match address
        .strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
    {
        Some(inner) => inner,
        None => address,
    };

    let address = match address.split_once('@') {
        Some((local, domain)) => {
            let local = validate(local).ok_or(AddressError::BadQuotedSequence)?;
            let domain = validate(domain).ok_or(AddressError::BadQuotedSequence)?;
            format!("{local}@{domain}")
        }
        None => validate(address).ok_or(AddressError::BadQuotedSequence)?,
    };

    Ok(EnvelopeAddress { address, options })
}

/// Matches `<@relay:address>options` first, then `<address>options`.
fn split_path(s: &str) -> Option<(&str, &str)> {
    let inner = s.strip_prefix('<')?;
    let close = inner.rfind('>')?;
    let (path, options) = (inner.get(..close)?, inner.get(close + 1..)?);

    if path.starts_with('@')
        && let Some((_, address)) = path.rsplit_once(':')
    {
        return Some((address, options));
    }
    Some((path, options))
}

/// Checks that every special character is escaped, then unescapes.
fn validate(part: &str) -> Option<String> {
    let mut previous = None;
    for c in part.chars() {
        if SPECIAL.contains(c) && previous != Some(QUOTE) {
            return None;
        }
        previous = Some(c);
    }
    Some(unquote(part))
}

fn unquote(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut chars = part.chars().peekable();
    while let Some(c) = chars.next() {
        if c == QUOTE
            && let Some(&next) = chars.peek()
            && (SPECIAL.contains(next) || next == QUOTE)
        {
            out.push(next);
            chars.next();
            continue;
        }
        out.push(c);
    }
    out
}

/// Local part of an address, lower-cased; the whole input if it has no `@`.
pub fn local_part(address: &str) -> String {
    address
        .split('@')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}
