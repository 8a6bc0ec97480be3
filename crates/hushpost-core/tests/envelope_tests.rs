//! End-to-end envelope scenarios across two identities.

use hushpost_core::crypto::KeyPair;
use hushpost_core::identity::{derive_chat_id, derive_user_id};
use hushpost_core::protocol::{contact_payload, decode_post, encode_post, PostType};
use hushpost_core::{DecodeError, Error};

#[test]
fn alice_and_bob_exchange_a_reply() {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let participants = vec![alice.public().clone(), bob.public().clone()];
    let chat_id = derive_chat_id(&participants, None);

    // Alice posts a question
    let (question, _) = encode_post(
        PostType::Text,
        "where should we meet?".as_bytes(),
        &participants,
        None,
        true,
        &alice,
    )
    .unwrap();

    let received = decode_post(&question, Some(chat_id), &participants, &bob, 100).unwrap();
    assert_eq!(received.payload, b"where should we meet?");
    assert_eq!(received.post_type, PostType::Text);
    assert_eq!(received.author.as_ref(), Some(alice.public()));

    // Bob replies, referencing Alice's post id
    let (reply, _) = encode_post(
        PostType::Text,
        "the usual place".as_bytes(),
        &participants,
        Some(received.post_id),
        true,
        &bob,
    )
    .unwrap();

    let answer = decode_post(&reply, Some(chat_id), &participants, &alice, 200).unwrap();
    assert_eq!(answer.payload, b"the usual place");
    assert_eq!(answer.post_type, PostType::Text);
    assert_eq!(answer.reply_to, Some(received.post_id));
    assert_eq!(answer.author.as_ref(), Some(bob.public()));
}

#[test]
fn group_chat_id_is_independent_of_who_computes_it() {
    let members: Vec<KeyPair> = (0..5).map(|_| KeyPair::generate()).collect();
    let keys: Vec<_> = members.iter().map(|m| m.public().clone()).collect();

    let reference = derive_chat_id(&keys, Some("book club"));
    let mut shuffled = keys.clone();
    shuffled.rotate_left(2);
    shuffled.swap(0, 3);
    assert_eq!(derive_chat_id(&shuffled, Some("book club")), reference);
    assert_ne!(derive_chat_id(&keys, Some("film club")), reference);
}

#[test]
fn every_group_member_can_read_and_attribute_a_post() {
    let members: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
    let keys: Vec<_> = members.iter().map(|m| m.public().clone()).collect();
    let chat_id = derive_chat_id(&keys, Some("ops"));

    let author = &members[2];
    let (bytes, _) = encode_post(PostType::Text, b"standup at 10", &keys, None, true, author)
        .unwrap();

    for member in &members {
        let decoded = decode_post(&bytes, Some(chat_id), &keys, member, 0).unwrap();
        assert_eq!(decoded.payload, b"standup at 10");
        assert_eq!(decoded.author.as_ref(), Some(author.public()));
    }
}

#[test]
fn contact_bootstrap_creates_a_chat_from_nothing() {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let participants = vec![alice.public().clone(), bob.public().clone()];
    let chat_id = derive_chat_id(&participants, None);

    let payload = contact_payload(&participants, None);
    let (bytes, _) = encode_post(
        PostType::Contact,
        &payload,
        &participants,
        None,
        true,
        &alice,
    )
    .unwrap();

    // Bob has never heard of this chat; the embedded keys carry it
    let decoded = decode_post(&bytes, Some(chat_id), &[], &bob, 0).unwrap();
    let contact = decoded.contact.expect("contact info missing");
    assert_eq!(contact.participants.len(), 2);
    assert!(contact
        .participants
        .iter()
        .any(|p| derive_user_id(p) == derive_user_id(bob.public())));
    assert_eq!(decoded.author.as_ref(), Some(alice.public()));
}

#[test]
fn a_forwarded_envelope_stays_sealed_to_outsiders() {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let router_operator = KeyPair::generate();
    let participants = vec![alice.public().clone(), bob.public().clone()];
    let chat_id = derive_chat_id(&participants, None);

    let (bytes, _) =
        encode_post(PostType::Text, b"private", &participants, None, true, &alice).unwrap();

    match decode_post(&bytes, Some(chat_id), &participants, &router_operator, 0) {
        Err(Error::Decode(DecodeError::NotAParticipant)) => {}
        other => panic!("outsider decoded the post: {:?}", other),
    }
}
