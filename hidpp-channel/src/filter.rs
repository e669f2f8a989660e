//! Content-addressed matching of raw messages.

use crate::message::offset;

/// Expects a single byte of a message to have a specific value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MessageFilter {
    /// The offset of the byte inside the raw message.
    pub offset: usize,

    /// The value the (masked) byte must equal.
    pub value: u8,

    /// Bits of the byte taking part in the comparison. All bits if `None`.
    pub mask: Option<u8>,
}

impl MessageFilter {
    pub const fn new(offset: usize, value: u8) -> Self {
        Self {
            offset,
            value,
            mask: None,
        }
    }

    pub const fn masked(offset: usize, value: u8, mask: u8) -> Self {
        Self {
            offset,
            value,
            mask: Some(mask),
        }
    }

    /// Checks the filter against raw message data.
    ///
    /// A filter pointing past the end of the data never matches.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.get(self.offset).is_some_and(|&byte| match self.mask {
            Some(mask) => byte & mask == self.value & mask,
            None => byte == self.value,
        })
    }
}

/// Matches HID++1.0 error responses.
pub const HIDPP1_ERROR_FILTER: MessageFilter = MessageFilter::new(offset::SUB_ID, 0x8f);

/// Matches HID++2.0 error responses.
pub const HIDPP2_ERROR_FILTER: MessageFilter = MessageFilter::new(offset::FEATURE_INDEX, 0xff);

const ERROR_FILTERS: [MessageFilter; 2] = [HIDPP1_ERROR_FILTER, HIDPP2_ERROR_FILTER];

/// A set of alternative filter lists.
///
/// A message matches if it satisfies every filter of at least one list.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Filters(Vec<Vec<MessageFilter>>);

impl Filters {
    /// Creates a set holding a single list of filters that all have to match.
    pub fn all(filters: impl IntoIterator<Item = MessageFilter>) -> Self {
        Self(vec![filters.into_iter().collect()])
    }

    /// Creates a set of alternative filter lists.
    pub fn any<I>(lists: impl IntoIterator<Item = I>) -> Self
    where
        I: IntoIterator<Item = MessageFilter>,
    {
        Self(lists.into_iter().map(|l| l.into_iter().collect()).collect())
    }

    /// Adds an alternative filter list.
    pub fn or(mut self, filters: impl IntoIterator<Item = MessageFilter>) -> Self {
        self.0.push(filters.into_iter().collect());
        self
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        self.0
            .iter()
            .any(|list| list.iter().all(|filter| filter.matches(data)))
    }

    pub fn alternatives(&self) -> &[Vec<MessageFilter>] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extends the set with an alternative for every HID++ error family not
    /// already listed on its own, returning the extended set and the appended
    /// filters.
    pub(crate) fn with_error_filters(&self) -> (Filters, Vec<MessageFilter>) {
        let mut extended = self.clone();
        let mut appended = Vec::new();

        for filter in ERROR_FILTERS {
            if !self.0.iter().any(|list| list == &[filter]) {
                extended.0.push(vec![filter]);
                appended.push(filter);
            }
        }

        (extended, appended)
    }
}

impl From<MessageFilter> for Filters {
    fn from(filter: MessageFilter) -> Self {
        Self::all([filter])
    }
}

impl From<Vec<MessageFilter>> for Filters {
    fn from(filters: Vec<MessageFilter>) -> Self {
        Self::all(filters)
    }
}

impl<const N: usize> From<[MessageFilter; N]> for Filters {
    fn from(filters: [MessageFilter; N]) -> Self {
        Self::all(filters)
    }
}

/// Decides whether a message received for a caller is escalated as an error.
#[derive(Debug)]
pub(crate) struct ErrorEscalation {
    requested: Option<Filters>,
    combined: Option<Filters>,
    appended: Vec<MessageFilter>,
}

impl ErrorEscalation {
    /// Escalation only applies to HID++ reads that filter on something and
    /// did not opt out.
    pub(crate) fn new(requested: Option<&Filters>, hidpp: bool, skip_error: bool) -> Self {
        match requested {
            Some(filters) if hidpp && !skip_error => {
                let (combined, appended) = filters.with_error_filters();
                Self {
                    requested: Some(filters.clone()),
                    combined: Some(combined),
                    appended,
                }
            },
            _ => Self {
                requested: requested.cloned(),
                combined: requested.cloned(),
                appended: Vec::new(),
            },
        }
    }

    /// The filters a queue read has to apply, if any.
    pub(crate) fn filters(&self) -> Option<&Filters> {
        self.combined.as_ref()
    }

    /// Whether the data only matched because of an appended error filter.
    pub(crate) fn is_escalated(&self, data: &[u8]) -> bool {
        let requested = self
            .requested
            .as_ref()
            .is_some_and(|filters| filters.matches(data));

        !requested && self.appended.iter().any(|filter| filter.matches(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET_REGISTER_RESPONSE: [u8; 7] = [0x10, 0xff, 0x81, 0x00, 0x00, 0x01, 0x00];
    const HIDPP1_ERROR: [u8; 7] = [0x10, 0xff, 0x8f, 0x81, 0x00, 0x03, 0x00];

    #[test]
    fn filter_matches_byte() {
        assert!(MessageFilter::new(2, 0x81).matches(&GET_REGISTER_RESPONSE));
        assert!(!MessageFilter::new(2, 0x80).matches(&GET_REGISTER_RESPONSE));
    }

    #[test]
    fn filter_out_of_range_never_matches() {
        assert!(!MessageFilter::new(7, 0x00).matches(&GET_REGISTER_RESPONSE));
        assert!(!MessageFilter::new(0, 0x00).matches(&[]));
    }

    #[test]
    fn masked_filter_ignores_other_bits() {
        let filter = MessageFilter::masked(5, 0x01, 0x01);
        assert!(filter.matches(&[0, 0, 0, 0, 0, 0x03]));
        assert!(!filter.matches(&[0, 0, 0, 0, 0, 0x02]));
    }

    #[test]
    fn filters_are_or_of_and_lists() {
        let filters = Filters::all([MessageFilter::new(2, 0x81), MessageFilter::new(3, 0x02)])
            .or([MessageFilter::new(2, 0x81), MessageFilter::new(3, 0x00)]);

        assert!(filters.matches(&GET_REGISTER_RESPONSE));
        assert!(!Filters::all([MessageFilter::new(2, 0x81), MessageFilter::new(3, 0x02)])
            .matches(&GET_REGISTER_RESPONSE));
        assert!(!Filters::default().matches(&GET_REGISTER_RESPONSE));
    }

    #[test]
    fn escalation_raises_untargeted_errors() {
        let requested = Filters::from(MessageFilter::new(2, 0x81));
        let escalation = ErrorEscalation::new(Some(&requested), true, false);

        let filters = escalation.filters().unwrap();
        assert!(filters.matches(&HIDPP1_ERROR));
        assert!(escalation.is_escalated(&HIDPP1_ERROR));
        assert!(!escalation.is_escalated(&GET_REGISTER_RESPONSE));
    }

    #[test]
    fn escalation_returns_targeted_errors() {
        let requested = Filters::from(HIDPP1_ERROR_FILTER);
        let escalation = ErrorEscalation::new(Some(&requested), true, false);

        assert!(!escalation.is_escalated(&HIDPP1_ERROR));
        assert_eq!(requested.with_error_filters().1, vec![HIDPP2_ERROR_FILTER]);
    }

    #[test]
    fn escalation_can_be_skipped() {
        let requested = Filters::from(MessageFilter::new(2, 0x81));

        let skipped = ErrorEscalation::new(Some(&requested), true, true);
        assert!(!skipped.filters().unwrap().matches(&HIDPP1_ERROR));

        let not_hidpp = ErrorEscalation::new(Some(&requested), false, false);
        assert!(!not_hidpp.is_escalated(&HIDPP1_ERROR));

        let unfiltered = ErrorEscalation::new(None, true, false);
        assert!(unfiltered.filters().is_none());
    }
}
