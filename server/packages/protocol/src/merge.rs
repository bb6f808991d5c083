use crate::{Message, MessagePart};

/// Fold `incoming` into a transcript. The message is matched by id and
/// appended when unseen.
pub fn merge_message(messages: &mut Vec<Message>, incoming: Message) {
    let Some(existing) = messages.iter_mut().find(|message| message.id == incoming.id) else {
        messages.push(incoming);
        return;
    };

    existing.role = incoming.role;
    if incoming.timestamp.is_some() {
        existing.timestamp = incoming.timestamp;
    }
    if incoming.model.is_some() {
        existing.model = incoming.model;
    }
    merge_parts(&mut existing.parts, incoming.parts);
}

/// Parts with a known id are replaced in place, unseen ids are appended in
/// arrival order.
pub fn merge_parts(existing: &mut Vec<MessagePart>, incoming: Vec<MessagePart>) {
    for part in incoming {
        match existing.iter_mut().find(|current| current.id == part.id) {
            Some(current) => *current = part,
            None => existing.push(part),
        }
    }
}
