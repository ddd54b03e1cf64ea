use std::collections::VecDeque;

/// Очередь ожидающих в порядке прихода; нужна для честного (FIFO) режима.
#[derive(Debug)]
pub(crate) struct WaitQueue<M> {
    entries: VecDeque<(u64, M)>,
    next_ticket: u64,
}

impl<M> Default for WaitQueue<M> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            next_ticket: 0,
        }
    }
}

impl<M> WaitQueue<M> {
    pub(crate) fn push(&mut self, meta: M) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.entries.push_back((ticket, meta));
        ticket
    }

    pub(crate) fn remove(&mut self, ticket: u64) {
        if let Some(pos) = self.entries.iter().position(|(t, _)| *t == ticket) {
            self.entries.remove(pos);
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<(u64, &M)> {
        self.entries.front().map(|(t, m)| (*t, m))
    }

    /// Может ли ожидающий с `ticket` пройти вперёд остальных.
    /// Новичок без билета проходит только при пустой очереди.
    pub(crate) fn is_first(&self, ticket: Option<u64>) -> bool {
        match (self.head(), ticket) {
            (None, _) => true,
            (Some((head, _)), Some(ticket)) => head == ticket,
            (Some(_), None) => false,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
